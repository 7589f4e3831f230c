use crate::config::ConfigError;
use crate::server::ServerError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to create state path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to resolve home directory for runtime state root")]
    HomeDirectoryUnavailable,
    #[error("failed to open log file {path}: {source}")]
    Logging {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid arguments: {0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
}
