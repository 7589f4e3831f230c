use super::{RemoteApi, RemoteError};
use crate::cancel::CancelToken;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub path: String,
    pub local_path: PathBuf,
    pub url: String,
}

/// Upload policy applied to each file; retries, chunking and the like
/// belong to implementations.
pub trait FileTransfer: Send + Sync {
    fn upload(
        &self,
        api: &dyn RemoteApi,
        task: &UploadTask,
        cancel: &CancelToken,
    ) -> Result<u64, RemoteError>;
}

/// Reads the whole file and uploads it in one attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTransfer;

impl FileTransfer for DirectTransfer {
    fn upload(
        &self,
        api: &dyn RemoteApi,
        task: &UploadTask,
        cancel: &CancelToken,
    ) -> Result<u64, RemoteError> {
        cancel.check()?;
        let data = fs::read(&task.local_path).map_err(|source| RemoteError::Source {
            path: task.local_path.display().to_string(),
            source,
        })?;
        api.upload_bytes(&task.url, &data, cancel)?;
        Ok(data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OfflineRemote;
    use tempfile::tempdir;

    #[test]
    fn direct_transfer_uploads_file_contents() {
        let dir = tempdir().expect("tempdir");
        let local_path = dir.path().join("out.txt");
        fs::write(&local_path, b"hello").expect("write");
        let remote = OfflineRemote::new();
        let task = UploadTask {
            path: "out.txt".to_string(),
            local_path,
            url: "offline://run/out.txt".to_string(),
        };

        let sent = DirectTransfer
            .upload(&remote, &task, &CancelToken::new())
            .expect("upload");
        assert_eq!(sent, 5);
        assert_eq!(remote.uploaded_bytes(), 5);
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = tempdir().expect("tempdir");
        let task = UploadTask {
            path: "gone".to_string(),
            local_path: dir.path().join("gone"),
            url: "offline://run/gone".to_string(),
        };
        let err = DirectTransfer
            .upload(&OfflineRemote::new(), &task, &CancelToken::new())
            .expect_err("missing");
        assert!(matches!(err, RemoteError::Source { .. }));
    }
}
