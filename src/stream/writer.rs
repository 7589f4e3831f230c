use crate::record::Record;
use crate::txlog::LogWriter;
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;

/// Decides which records reach the transaction log.
pub trait RecordFilter: Send + Sync {
    fn accept(&self, record: &Record) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RecordFilter for AcceptAll {
    fn accept(&self, _record: &Record) -> bool {
        true
    }
}

/// Second stage: appends accepted records to the log, then passes every
/// record on to the sender.
pub(super) struct Writer {
    stream_id: String,
    log: Option<LogWriter>,
    filter: Arc<dyn RecordFilter>,
}

impl Writer {
    pub(super) fn new(stream_id: String, log: Option<LogWriter>, filter: Arc<dyn RecordFilter>) -> Self {
        Self {
            stream_id,
            log,
            filter,
        }
    }

    pub(super) fn run(mut self, input: Receiver<Record>, forward: Sender<Record>) {
        let mut forwarding = true;
        for record in input.iter() {
            self.write(&record);
            if input.is_empty() {
                self.flush();
            }
            if forwarding && forward.send(record).is_err() {
                tracing::warn!(stream_id = %self.stream_id, "writer: sender gone, logging only");
                forwarding = false;
            }
        }
        self.flush();
        if let Some(log) = &self.log {
            tracing::info!(
                stream_id = %self.stream_id,
                path = %log.path().display(),
                records = log.records_written(),
                "writer: transaction log closed"
            );
        }
    }

    fn write(&mut self, record: &Record) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        if !self.filter.accept(record) {
            return;
        }
        if let Err(err) = log.append(record) {
            tracing::error!(stream_id = %self.stream_id, error = %err, "writer: append failed");
        }
    }

    fn flush(&mut self) {
        if let Some(log) = self.log.as_mut() {
            if let Err(err) = log.flush() {
                tracing::error!(stream_id = %self.stream_id, error = %err, "writer: flush failed");
            }
        }
    }
}
