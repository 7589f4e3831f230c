use crate::shared::errors::ServiceError;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_STATE_ROOT_DIR: &str = ".runhub";
pub const STATE_ROOT_ENV: &str = "RUNHUB_STATE_ROOT";
pub const TRANSACTION_LOG_EXTENSION: &str = "rhl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.root.join("logs"),
            self.root.join("runs"),
            self.root.join("staging"),
            self.root.join("daemon"),
        ]
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn default_port_file(&self) -> PathBuf {
        self.daemon_dir().join("port")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.root.join("logs/runtime.log")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn transaction_log_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(format!("run-{run_id}.{TRANSACTION_LOG_EXTENSION}"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }
}

pub fn default_state_root_path() -> Result<PathBuf, ServiceError> {
    if let Some(root) = std::env::var_os(STATE_ROOT_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    let home = std::env::var_os("HOME").ok_or(ServiceError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), ServiceError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| ServiceError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
