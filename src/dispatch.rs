//! Routes finished results back to the connection that asked for them.

use crate::record::{RecordResult, ServerResponse};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Sink that hands a response to one live connection.
///
/// Implementations must not block: the dispatch path serves every
/// connection attached to a stream.
pub trait Responder: Send + Sync {
    fn respond(&self, response: ServerResponse);
}

#[derive(Clone)]
pub struct ResponderEntry {
    pub id: String,
    pub responder: Arc<dyn Responder>,
}

impl ResponderEntry {
    pub fn new(id: impl Into<String>, responder: Arc<dyn Responder>) -> Self {
        Self {
            id: id.into(),
            responder,
        }
    }
}

#[derive(Default)]
pub struct Dispatcher {
    responders: RwLock<HashMap<String, Arc<dyn Responder>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers each entry; an id that is already present keeps its
    /// original responder.
    pub fn add_responders(&self, entries: impl IntoIterator<Item = ResponderEntry>) {
        let mut responders = self
            .responders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for entry in entries {
            if responders.contains_key(&entry.id) {
                tracing::warn!(responder_id = %entry.id, "dispatch: responder already registered");
                continue;
            }
            responders.insert(entry.id, entry.responder);
        }
    }

    pub fn remove_responder(&self, id: &str) -> bool {
        self.responders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn has_responder(&self, id: &str) -> bool {
        self.responders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Delivers `result` to the connection named in its control block.
    ///
    /// Results for an empty or unknown connection are logged and dropped.
    pub fn handle_respond(&self, result: RecordResult) -> bool {
        if result.control.local {
            tracing::debug!("dispatch: skipping local result");
            return false;
        }
        let id = result.control.connection_id.clone();
        if id.is_empty() {
            tracing::error!(kind = ?result.kind, "dispatch: result has no connection id");
            return false;
        }
        let responder = self
            .responders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        match responder {
            Some(responder) => {
                responder.respond(ServerResponse::result(result));
                true
            }
            None => {
                tracing::error!(connection_id = %id, "dispatch: no responder for connection");
                false
            }
        }
    }
}
