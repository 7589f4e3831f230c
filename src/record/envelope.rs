use super::{Record, RecordResult, RunSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub kind: ServerRequestKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRequestKind {
    InformInit {
        stream_id: String,
        settings: RunSettings,
    },
    InformStart {
        stream_id: String,
        settings: RunSettings,
    },
    InformAttach {
        stream_id: String,
    },
    /// Fire-and-forget record.
    RecordPublish(Record),
    /// Record whose result the client waits for.
    RecordCommunicate(Record),
    InformFinish {
        stream_id: String,
    },
    InformTeardown {
        exit_code: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    pub kind: ServerResponseKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerResponseKind {
    ResultCommunicate(RecordResult),
    InformAttachResponse {
        stream_id: String,
        settings: RunSettings,
    },
}

impl ServerRequest {
    pub fn new(kind: ServerRequestKind) -> Self {
        Self {
            request_id: String::new(),
            kind,
        }
    }
}

impl ServerResponse {
    pub fn result(result: RecordResult) -> Self {
        Self {
            request_id: String::new(),
            kind: ServerResponseKind::ResultCommunicate(result),
        }
    }
}
