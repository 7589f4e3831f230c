//! Ordered, backpressured handoff of one run's records to its worker.

use crate::cancel::CancelToken;
use crate::record::Record;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunWorkError {
    #[error("run work for stream {stream_id} no longer accepts records")]
    Done { stream_id: String },
    #[error("add to stream {stream_id} abandoned because its done signal fired")]
    Canceled { stream_id: String },
    #[error("add to stream {stream_id} timed out after {waited:?}")]
    TimedOut { stream_id: String, waited: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunWorkState {
    Open,
    Draining,
    Closed,
}

/// FIFO queue bound to a single stream.
///
/// The connection's read path is the only producer and a single
/// [`RunWorkReader`] is the only consumer, so records are processed in the
/// order they were accepted.
pub struct RunWork {
    stream_id: String,
    sender: Mutex<Option<Sender<Record>>>,
    receiver: Mutex<Option<Receiver<Record>>>,
    reader_taken: AtomicBool,
    before_end: CancelToken,
    drained: CancelToken,
    closed: AtomicBool,
}

impl RunWork {
    pub fn new(stream_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        Self {
            stream_id: stream_id.into(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            reader_taken: AtomicBool::new(false),
            before_end: CancelToken::new(),
            drained: CancelToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Enqueues `record`, blocking while the queue is full.
    pub fn add(&self, record: Record) -> Result<(), RunWorkError> {
        let sender = self.open_sender(&record)?;
        sender.send(record).map_err(|_| self.done_error())
    }

    /// Like [`RunWork::add`] but gives up once `done` is canceled, so a
    /// stalled queue cannot wedge an unrelated shutdown path.
    pub fn add_or_cancel(&self, done: &CancelToken, record: Record) -> Result<(), RunWorkError> {
        let sender = self.open_sender(&record)?;
        if done.is_canceled() {
            return Err(self.canceled_error());
        }
        channel::select! {
            send(sender, record) -> sent => sent.map_err(|_| self.done_error()),
            recv(done.done()) -> _ => Err(self.canceled_error()),
        }
    }

    /// Enqueues `record` unless the queue stays full for `timeout` or is
    /// marked done meanwhile.
    pub fn add_timeout(&self, record: Record, timeout: Duration) -> Result<(), RunWorkError> {
        let sender = self.open_sender(&record)?;
        channel::select! {
            send(sender, record) -> sent => sent.map_err(|_| self.done_error()),
            recv(self.before_end.done()) -> _ => Err(self.done_error()),
            default(timeout) => Err(RunWorkError::TimedOut {
                stream_id: self.stream_id.clone(),
                waited: timeout,
            }),
        }
    }

    /// Canceled when [`RunWork::set_done`] runs, strictly before the reader
    /// observes the end of the queue.
    pub fn before_end(&self) -> CancelToken {
        self.before_end.clone()
    }

    /// Stops accepting records; everything already accepted still drains.
    pub fn set_done(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            tracing::debug!(stream_id = %self.stream_id, "runwork: set done");
            self.before_end.cancel();
        }
        drop(sender);
    }

    pub fn is_done(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub fn state(&self) -> RunWorkState {
        if self.closed.load(Ordering::Acquire) {
            RunWorkState::Closed
        } else if self.is_done() {
            RunWorkState::Draining
        } else {
            RunWorkState::Open
        }
    }

    /// Hands out the single consumer end. Later calls return `None`.
    pub fn reader(&self) -> Option<RunWorkReader> {
        if self.reader_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        Some(RunWorkReader {
            receiver,
            drained: self.drained.clone(),
        })
    }

    /// Marks the queue done, waits for the reader to drain it, then releases
    /// the channel. Idempotent.
    pub fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.set_done();

        if self.reader_taken.swap(true, Ordering::AcqRel) {
            self.drained.wait();
        } else {
            self.discard_unread();
        }

        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.store(true, Ordering::Release);
        tracing::debug!(stream_id = %self.stream_id, "runwork: closed");
    }

    fn discard_unread(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(receiver) = receiver else {
            return;
        };
        let discarded = receiver.try_iter().count();
        if discarded > 0 {
            tracing::warn!(
                stream_id = %self.stream_id,
                discarded,
                "runwork: closed without a reader, records discarded"
            );
        }
        self.drained.cancel();
    }

    fn open_sender(&self, record: &Record) -> Result<Sender<Record>, RunWorkError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sender.ok_or_else(|| {
            tracing::warn!(
                stream_id = %self.stream_id,
                kind = record.kind_name(),
                "runwork: ignoring record added after done"
            );
            self.done_error()
        })
    }

    fn done_error(&self) -> RunWorkError {
        RunWorkError::Done {
            stream_id: self.stream_id.clone(),
        }
    }

    fn canceled_error(&self) -> RunWorkError {
        RunWorkError::Canceled {
            stream_id: self.stream_id.clone(),
        }
    }
}

/// Consumer end of a [`RunWork`].
pub struct RunWorkReader {
    receiver: Receiver<Record>,
    drained: CancelToken,
}

impl RunWorkReader {
    /// Blocks for the next record; `None` once the queue is done and empty.
    pub fn next(&self) -> Option<Record> {
        match self.receiver.recv() {
            Ok(record) => Some(record),
            Err(_) => {
                self.drained.cancel();
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Record> + '_ {
        std::iter::from_fn(move || self.next())
    }
}

impl Drop for RunWorkReader {
    fn drop(&mut self) {
        // A reader that goes away early must not leave `close` waiting.
        self.drained.cancel();
    }
}
