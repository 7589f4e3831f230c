use super::{Control, Record};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Canceled,
    Communication,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(ErrorCode::Canceled, "operation canceled")
    }

    pub fn is_canceled(&self) -> bool {
        self.code == ErrorCode::Canceled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    #[serde(default)]
    pub control: Control,
    pub kind: ResultKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Run(RunResult),
    Exit(ExitResult),
    Files(FilesResult),
    Artifact(ArtifactResult),
    Status(StatusResult),
    Ack(AckResult),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesResult {
    #[serde(default)]
    pub uploaded: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactResult {
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub entries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub stream_id: String,
    pub records_handled: u64,
    pub done: bool,
    /// Unix milliseconds at which the stream's pipeline started.
    #[serde(default)]
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl RecordResult {
    /// Result addressed back to wherever `record` came from.
    pub fn for_record(record: &Record, kind: ResultKind) -> Self {
        Self {
            control: record.control.clone(),
            kind,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match &self.kind {
            ResultKind::Run(result) => result.error.as_ref(),
            ResultKind::Exit(result) => result.error.as_ref(),
            ResultKind::Files(result) => result.error.as_ref(),
            ResultKind::Artifact(result) => result.error.as_ref(),
            ResultKind::Ack(result) => result.error.as_ref(),
            ResultKind::Status(_) => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.error().is_some_and(ErrorInfo::is_canceled)
    }
}
