pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::load_settings;
pub use settings::{
    Settings, DEFAULT_API_CONCURRENCY, DEFAULT_MAX_FRAME_BYTES, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
