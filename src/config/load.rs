use super::{ConfigError, Settings};
use crate::runtime::StatePaths;

/// Loads `config.yaml` from the state root, falling back to defaults when the
/// file does not exist.
pub fn load_settings(paths: &StatePaths) -> Result<Settings, ConfigError> {
    let path = paths.settings_file();
    let settings = if path.exists() {
        Settings::from_path(&path)?
    } else {
        Settings::default()
    };
    settings.validate()?;
    Ok(settings)
}
