use super::errors::ServiceError;
use crate::runtime::StatePaths;
use std::fs;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "RUNHUB_LOG";

/// Installs the process-wide tracing subscriber, appending to the state
/// root's runtime log. `RUNHUB_LOG` overrides `level` when set.
///
/// A subscriber installed earlier (tests, embedding hosts) is left in place.
pub fn init_logging(paths: &StatePaths, level: &str) -> Result<(), ServiceError> {
    let path = paths.runtime_log_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ServiceError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| ServiceError::Logging {
            path: path.display().to_string(),
            source,
        })?;

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed; keeping it");
    }
    Ok(())
}
