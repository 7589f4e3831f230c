//! Seams to the backend: metadata submission, signed upload URLs and byte
//! uploads. Retrying is left to the implementations.

pub mod limiter;
pub mod offline;
pub mod transfer;

pub use limiter::{ConcurrencyLimiter, Permit};
pub use offline::OfflineRemote;
pub use transfer::{DirectTransfer, FileTransfer, UploadTask};

use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote operation canceled")]
    Canceled,
    #[error("backend rejected {kind}: {message}")]
    Rejected { kind: String, message: String },
    #[error("failed to read upload source {path}: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upload to {url} failed: {message}")]
    Upload { url: String, message: String },
}

impl RemoteError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<crate::cancel::Canceled> for RemoteError {
    fn from(_: crate::cancel::Canceled) -> Self {
        Self::Canceled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub entity: String,
    pub project: String,
    pub run_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadUrls {
    /// Signed URL per requested file path.
    pub urls: BTreeMap<String, String>,
    /// Latest history step the backend has, when it reports one.
    pub live_steps: Option<i64>,
}

/// Backend capability used by stream workers.
///
/// Every call takes the operation's cancel token and must return
/// [`RemoteError::Canceled`] promptly once it fires.
pub trait RemoteApi: Send + Sync {
    fn submit_metadata(
        &self,
        kind: &str,
        payload: &Value,
        cancel: &CancelToken,
    ) -> Result<(), RemoteError>;

    fn signed_upload_urls(
        &self,
        run: &RunIdentity,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<UploadUrls, RemoteError>;

    fn upload_bytes(&self, url: &str, data: &[u8], cancel: &CancelToken)
        -> Result<(), RemoteError>;
}
