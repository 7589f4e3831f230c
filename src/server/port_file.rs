use super::ServerError;
use crate::shared::fs_atomic::atomic_write_file;
use std::fs;
use std::path::Path;

const PORT_KEY: &str = "sock=";
const PORT_FILE_END: &str = "EOF";

pub fn encode_port_file(port: u16) -> String {
    format!("{PORT_KEY}{port}\n{PORT_FILE_END}")
}

/// Announces `port` to clients; readers never see a partial file.
pub fn write_port_file(path: &Path, port: u16) -> Result<(), ServerError> {
    let port_file_error = |source| ServerError::PortFile {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(port_file_error)?;
    }
    atomic_write_file(path, encode_port_file(port).as_bytes()).map_err(port_file_error)
}

/// Port announced in a port file, or `None` until the file is complete.
pub fn parse_port_file(raw: &str) -> Option<u16> {
    let mut port = None;
    let mut complete = false;
    for line in raw.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix(PORT_KEY) {
            port = value.parse().ok();
        } else if line == PORT_FILE_END {
            complete = true;
        }
    }
    port.filter(|_| complete)
}

pub fn read_port_file(path: &Path) -> Result<Option<u16>, ServerError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(parse_port_file(&raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ServerError::PortFile {
            path: path.display().to_string(),
            source,
        }),
    }
}
