use crate::mailbox::CancelRegistry;
use crate::record::{
    AckResult, Record, RecordKind, RecordResult, Request, ResultKind, StatusResult,
};
use crate::runwork::{RunWork, RunWorkReader};
use crossbeam::channel::Sender;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// First stage: answers requests about the stream itself and forwards
/// everything else, in order, to the writer.
pub(super) struct Handler {
    pub(super) stream_id: String,
    pub(super) run_work: Arc<RunWork>,
    pub(super) cancels: Arc<CancelRegistry>,
    pub(super) records_handled: Arc<AtomicU64>,
    pub(super) started_at_ms: i64,
    pub(super) forward: Sender<Record>,
    pub(super) results: Sender<RecordResult>,
}

impl Handler {
    pub(super) fn run(self, reader: RunWorkReader) {
        for record in reader.iter() {
            self.handle(record);
        }
        tracing::debug!(
            stream_id = %self.stream_id,
            records = self.records_handled.load(Ordering::Relaxed),
            "handler: finished"
        );
    }

    fn handle(&self, record: Record) {
        let handled = self.records_handled.fetch_add(1, Ordering::Relaxed) + 1;
        let RecordKind::Request(request) = &record.kind else {
            if self.forward.send(record).is_err() {
                tracing::warn!(stream_id = %self.stream_id, "handler: writer gone, record dropped");
            }
            return;
        };

        let kind = match request {
            Request::Cancel { cancel_slot } => {
                let found = self.cancels.cancel(cancel_slot);
                tracing::debug!(stream_id = %self.stream_id, cancel_slot, found, "handler: cancel");
                ResultKind::Ack(AckResult::default())
            }
            Request::Status => ResultKind::Status(StatusResult {
                stream_id: self.stream_id.clone(),
                records_handled: handled,
                done: self.run_work.is_done(),
                started_at_ms: self.started_at_ms,
            }),
            Request::Shutdown => {
                tracing::info!(stream_id = %self.stream_id, "handler: shutdown requested");
                self.run_work.set_done();
                ResultKind::Ack(AckResult::default())
            }
        };
        self.respond(&record, kind);
    }

    fn respond(&self, record: &Record, kind: ResultKind) {
        if !record.requests_result() {
            return;
        }
        if self
            .results
            .send(RecordResult::for_record(record, kind))
            .is_err()
        {
            tracing::warn!(stream_id = %self.stream_id, "handler: dispatch gone, result dropped");
        }
    }
}
