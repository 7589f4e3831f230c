pub mod state_paths;
pub mod watchdog;

pub use state_paths::{
    bootstrap_state_root, default_state_root_path, StatePaths, DEFAULT_STATE_ROOT_DIR,
    STATE_ROOT_ENV,
};
pub use watchdog::{is_process_alive, spawn_parent_watchdog, PARENT_POLL_INTERVAL};
