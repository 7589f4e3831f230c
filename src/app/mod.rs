//! Service entry point: argument parsing and the serve-until-shutdown loop.

use crate::config::load_settings;
use crate::runtime::{
    bootstrap_state_root, default_state_root_path, spawn_parent_watchdog, StatePaths,
    PARENT_POLL_INTERVAL,
};
use crate::server::Server;
use crate::shared::errors::ServiceError;
use crate::shared::logging::init_logging;
use crate::stream::StreamServices;
use std::path::PathBuf;

pub const USAGE: &str =
    "usage: runhub [--port-filename <path>] [--state-root <dir>] [--pid <parent-pid>]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceArgs {
    pub port_filename: Option<PathBuf>,
    pub state_root: Option<PathBuf>,
    pub parent_pid: Option<u32>,
}

pub fn parse_service_args(args: &[String]) -> Result<ServiceArgs, ServiceError> {
    let mut parsed = ServiceArgs::default();
    let mut index = 0usize;
    while index < args.len() {
        let (flag, inline) = match args[index].split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (args[index].as_str(), None),
        };
        let value = match inline {
            Some(value) => value,
            None => {
                if flag == "--help" || flag == "-h" {
                    return Err(ServiceError::Usage(USAGE.to_string()));
                }
                index += 1;
                args.get(index).cloned().ok_or_else(|| {
                    ServiceError::Usage(format!("missing value for `{flag}`\n{USAGE}"))
                })?
            }
        };
        if value.trim().is_empty() {
            return Err(ServiceError::Usage(format!(
                "value for `{flag}` must be non-empty"
            )));
        }

        match flag {
            "--port-filename" => parsed.port_filename = Some(PathBuf::from(value)),
            "--state-root" => parsed.state_root = Some(PathBuf::from(value)),
            "--pid" => {
                let pid = value.parse::<u32>().map_err(|_| {
                    ServiceError::Usage(format!("invalid value for `--pid`: {value}"))
                })?;
                parsed.parent_pid = Some(pid);
            }
            other => {
                return Err(ServiceError::Usage(format!(
                    "unknown argument `{other}`\n{USAGE}"
                )))
            }
        }
        index += 1;
    }
    Ok(parsed)
}

/// Serves until a teardown request arrives or the parent process exits.
pub fn run_service(args: ServiceArgs) -> Result<(), ServiceError> {
    let root = match args.state_root {
        Some(root) => root,
        None => default_state_root_path()?,
    };
    let paths = StatePaths::new(root);
    bootstrap_state_root(&paths)?;
    let settings = load_settings(&paths)?;
    init_logging(&paths, &settings.log_level)?;

    let services = StreamServices::new(paths.clone(), &settings);
    let server = Server::bind(settings, services)?;
    server.start()?;

    let port_file = args
        .port_filename
        .unwrap_or_else(|| paths.default_port_file());
    if let Err(err) = server.write_port_file(&port_file) {
        server.shutdown_token().cancel();
        server.close();
        return Err(err.into());
    }
    tracing::info!(
        addr = %server.local_addr(),
        port_file = %port_file.display(),
        "service ready"
    );

    let watchdog = args.parent_pid.map(|pid| {
        spawn_parent_watchdog(pid, server.shutdown_token(), PARENT_POLL_INTERVAL)
    });

    server.close();
    if let Some(watchdog) = watchdog {
        let _ = watchdog.join();
    }
    tracing::info!("service stopped");
    Ok(())
}
