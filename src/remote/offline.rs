use super::{RemoteApi, RemoteError, RunIdentity, UploadUrls};
use crate::cancel::CancelToken;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

pub const OFFLINE_URL_SCHEME: &str = "offline://";

/// Backend stand-in for offline runs: accepts everything and does no I/O.
#[derive(Debug, Default)]
pub struct OfflineRemote {
    submitted: AtomicU64,
    uploaded_bytes: AtomicU64,
}

impl OfflineRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }
}

impl RemoteApi for OfflineRemote {
    fn submit_metadata(
        &self,
        kind: &str,
        _payload: &Value,
        cancel: &CancelToken,
    ) -> Result<(), RemoteError> {
        cancel.check()?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kind, "offline remote: metadata accepted");
        Ok(())
    }

    fn signed_upload_urls(
        &self,
        run: &RunIdentity,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<UploadUrls, RemoteError> {
        cancel.check()?;
        let urls = files
            .iter()
            .map(|file| {
                (
                    file.clone(),
                    format!("{OFFLINE_URL_SCHEME}{}/{}", run.run_id, file),
                )
            })
            .collect();
        Ok(UploadUrls {
            urls,
            live_steps: None,
        })
    }

    fn upload_bytes(&self, url: &str, data: &[u8], cancel: &CancelToken) -> Result<(), RemoteError> {
        cancel.check()?;
        self.uploaded_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        tracing::trace!(url, bytes = data.len(), "offline remote: upload accepted");
        Ok(())
    }
}
