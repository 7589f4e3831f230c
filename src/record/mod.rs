//! Records sent by clients, the results produced for them, and the
//! envelopes both travel in on the wire.

pub mod envelope;
pub mod result;
pub mod settings;

pub use envelope::{ServerRequest, ServerRequestKind, ServerResponse, ServerResponseKind};
pub use result::{
    AckResult, ArtifactResult, ErrorCode, ErrorInfo, ExitResult, FilesResult, RecordResult,
    ResultKind, RunResult, StatusResult,
};
pub use settings::RunSettings;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Routing metadata attached to a record and echoed on its result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mailbox_slot: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub req_resp: bool,
    /// Originated inside the service; results go to the stream's mailbox.
    #[serde(default, skip_serializing_if = "is_false")]
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub stream_id: String,
    #[serde(default)]
    pub num: i64,
    #[serde(default)]
    pub control: Control,
    pub kind: RecordKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Run(RunRecord),
    History(HistoryRecord),
    Summary(SummaryRecord),
    Config(ConfigRecord),
    Output(OutputRecord),
    Files(FilesRecord),
    Artifact(ArtifactRecord),
    Exit(ExitRecord),
    Request(Request),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub step: i64,
    #[serde(default)]
    pub items: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    #[serde(default)]
    pub update: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(default)]
    pub update: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    /// Path relative to the run's files directory.
    pub path: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesRecord {
    pub files: Vec<FileItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactData {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub artifact_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Vec<ArtifactData>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Abort the in-flight operation registered under `cancel_slot`.
    Cancel { cancel_slot: String },
    Status,
    Shutdown,
}

impl Record {
    pub fn new(stream_id: impl Into<String>, kind: RecordKind) -> Self {
        Self {
            stream_id: stream_id.into(),
            num: 0,
            control: Control::default(),
            kind,
        }
    }

    /// A record gets exactly one result when it asks for one; everything
    /// else is fire-and-forget.
    pub fn requests_result(&self) -> bool {
        self.control.req_resp || !self.control.mailbox_slot.is_empty()
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            RecordKind::Run(_) => "run",
            RecordKind::History(_) => "history",
            RecordKind::Summary(_) => "summary",
            RecordKind::Config(_) => "config",
            RecordKind::Output(_) => "output",
            RecordKind::Files(_) => "files",
            RecordKind::Artifact(_) => "artifact",
            RecordKind::Exit(_) => "exit",
            RecordKind::Request(Request::Cancel { .. }) => "request.cancel",
            RecordKind::Request(Request::Status) => "request.status",
            RecordKind::Request(Request::Shutdown) => "request.shutdown",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, RecordKind::Request(_))
    }
}
