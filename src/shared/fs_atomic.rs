use std::fs;
use std::io::Write;
use std::path::Path;

/// Writes `content` to a temp file beside `path`, fsyncs it, then renames
/// it over `path` so readers never observe a partial file.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = format!(
        ".{}.tmp-",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("runhub")
    );

    let mut staged = tempfile::Builder::new().prefix(&prefix).tempfile_in(parent)?;
    staged.write_all(content)?;
    staged.as_file().sync_all()?;
    // A failed persist drops the temp file, which removes it.
    staged.persist(path).map_err(|err| err.error)?;
    sync_parent_dir(parent)
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
