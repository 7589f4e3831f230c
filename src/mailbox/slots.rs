use super::MailboxError;
use crate::cancel::CancelToken;
use crate::record::{Record, RecordResult};
use crate::shared::ids::new_mailbox_slot;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Registry of single-use reply slots.
///
/// Cloning shares the registry. A slot is removed on first delivery, when
/// its handle is dropped, or by [`Mailbox::abandon_all`].
#[derive(Clone, Default)]
pub struct Mailbox {
    table: Arc<SlotTable>,
}

#[derive(Default)]
struct SlotTable {
    slots: Mutex<HashMap<String, Sender<RecordResult>>>,
}

impl SlotTable {
    fn remove(&self, slot: &str) -> Option<Sender<RecordResult>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(slot)
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps a fresh slot onto `record` and returns the handle that will
    /// receive its result.
    pub fn deliver(&self, record: &mut Record) -> MailboxHandle {
        let (sender, receiver) = channel::bounded(1);
        let slot = {
            let mut slots = self
                .table
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = loop {
                let candidate = new_mailbox_slot();
                if !slots.contains_key(&candidate) {
                    break candidate;
                }
            };
            slots.insert(slot.clone(), sender);
            slot
        };
        record.control.mailbox_slot = slot.clone();
        MailboxHandle {
            slot,
            receiver,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Delivers `result` to the handle waiting on its slot.
    ///
    /// Returns false when no live handle is registered for the slot: unknown,
    /// already answered, or abandoned. Callers log that; it is never fatal.
    pub fn respond(&self, result: &RecordResult) -> bool {
        let slot = &result.control.mailbox_slot;
        if slot.is_empty() {
            return false;
        }
        match self.table.remove(slot) {
            Some(sender) => sender.send(result.clone()).is_ok(),
            None => false,
        }
    }

    /// Drops every registration; waiting handles see
    /// [`MailboxError::Abandoned`].
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<_> = self
            .table
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        drained.len()
    }

    pub fn pending(&self) -> usize {
        self.table
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct MailboxHandle {
    slot: String,
    receiver: Receiver<RecordResult>,
    table: Weak<SlotTable>,
}

impl MailboxHandle {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Blocks until the result arrives, `cancel` fires, or the slot is
    /// abandoned.
    pub fn wait(&self, cancel: &CancelToken) -> Result<RecordResult, MailboxError> {
        match self.receiver.try_recv() {
            Ok(result) => return Ok(result),
            Err(TryRecvError::Disconnected) => return Err(self.abandoned()),
            Err(TryRecvError::Empty) => {}
        }
        channel::select! {
            recv(self.receiver) -> result => result.map_err(|_| self.abandoned()),
            recv(cancel.done()) -> _ => Err(MailboxError::Canceled {
                slot: self.slot.clone(),
            }),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<RecordResult, MailboxError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(MailboxError::TimedOut {
                slot: self.slot.clone(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(self.abandoned()),
        }
    }

    fn abandoned(&self) -> MailboxError {
        MailboxError::Abandoned {
            slot: self.slot.clone(),
        }
    }
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.slot);
        }
    }
}

impl std::fmt::Debug for MailboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxHandle")
            .field("slot", &self.slot)
            .finish()
    }
}
