//! Per-run processing pipeline.
//!
//! A [`Stream`] owns one run's [`RunWork`] queue and the threads draining
//! it: the handler answers local requests, the writer appends to the
//! transaction log, the sender talks to the backend, and the dispatch
//! thread routes results to connections or to in-process waiters.

mod handler;
pub mod mux;
mod replay;
mod sender;
pub mod writer;

pub use mux::StreamMux;
pub use writer::{AcceptAll, RecordFilter};

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::dispatch::{Dispatcher, ResponderEntry};
use crate::mailbox::{CancelRegistry, Mailbox, MailboxHandle};
use crate::record::{ExitRecord, Record, RecordKind, RecordResult, RunSettings};
use crate::remote::{ConcurrencyLimiter, DirectTransfer, FileTransfer, OfflineRemote, RemoteApi};
use crate::runtime::state_paths::TRANSACTION_LOG_EXTENSION;
use crate::runtime::StatePaths;
use crate::runwork::{RunWork, RunWorkError};
use crate::shared::ids::validate_identifier_value;
use crate::shared::time::now_millis;
use crate::txlog::{LogReader, LogWriter, TxLogError};
use crossbeam::channel::{self, Receiver};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream {stream_id} already exists")]
    Duplicate { stream_id: String },
    #[error("stream {stream_id} not found")]
    NotFound { stream_id: String },
    #[error("stream {stream_id} was already started")]
    AlreadyStarted { stream_id: String },
    #[error("invalid settings for stream {stream_id}: {reason}")]
    InvalidSettings { stream_id: String, reason: String },
    #[error(transparent)]
    RunWork(#[from] RunWorkError),
    #[error(transparent)]
    TxLog(#[from] TxLogError),
    #[error("failed to spawn {worker} thread for stream {stream_id}: {source}")]
    Spawn {
        stream_id: String,
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Collaborators shared by every stream in the service.
#[derive(Clone)]
pub struct StreamServices {
    pub paths: StatePaths,
    pub remote: Arc<dyn RemoteApi>,
    pub transfer: Arc<dyn FileTransfer>,
    pub limiter: ConcurrencyLimiter,
    pub filter: Arc<dyn RecordFilter>,
    pub queue_capacity: usize,
}

impl StreamServices {
    /// Offline backend, single-attempt uploads and an unfiltered log.
    pub fn new(paths: StatePaths, settings: &Settings) -> Self {
        Self {
            paths,
            remote: Arc::new(OfflineRemote::new()),
            transfer: Arc::new(DirectTransfer),
            limiter: ConcurrencyLimiter::new(settings.api_concurrency),
            filter: Arc::new(AcceptAll),
            queue_capacity: settings.queue_capacity,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn RecordFilter>) -> Self {
        self.filter = filter;
        self
    }
}

pub struct Stream {
    id: String,
    settings: RwLock<RunSettings>,
    services: StreamServices,
    run_work: Arc<RunWork>,
    dispatcher: Arc<Dispatcher>,
    mailbox: Mailbox,
    cancels: Arc<CancelRegistry>,
    abort: CancelToken,
    records_handled: Arc<AtomicU64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Stream {
    pub fn new(stream_id: impl Into<String>, settings: RunSettings, services: StreamServices) -> Self {
        let id = stream_id.into();
        let run_work = Arc::new(RunWork::new(id.clone(), services.queue_capacity));
        Self {
            id,
            settings: RwLock::new(settings),
            services,
            run_work,
            dispatcher: Arc::new(Dispatcher::new()),
            mailbox: Mailbox::new(),
            cancels: Arc::new(CancelRegistry::new()),
            abort: CancelToken::new(),
            records_handled: Arc::new(AtomicU64::new(0)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opens the transaction log (or the log being replayed) and spawns the
    /// pipeline threads.
    pub fn start(&self) -> Result<(), StreamError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(StreamError::AlreadyStarted {
                stream_id: self.id.clone(),
            });
        }
        let settings = self.settings();
        validate_identifier_value("run_id", &settings.run_id).map_err(|reason| {
            StreamError::InvalidSettings {
                stream_id: self.id.clone(),
                reason,
            }
        })?;
        let reader = self.run_work.reader().ok_or_else(|| StreamError::AlreadyStarted {
            stream_id: self.id.clone(),
        })?;

        let replay = match &settings.replay_file {
            Some(path) => Some(LogReader::open(path)?),
            None => None,
        };
        let log = if replay.is_some() || settings.skip_transaction_log {
            None
        } else {
            Some(LogWriter::create(&self.transaction_log_path(&settings))?)
        };

        let capacity = self.services.queue_capacity.max(1);
        let (forward_tx, forward_rx) = channel::bounded(capacity);
        let (send_tx, send_rx) = channel::bounded(capacity);
        let (results_tx, results_rx) = channel::unbounded();

        let handler = handler::Handler {
            stream_id: self.id.clone(),
            run_work: Arc::clone(&self.run_work),
            cancels: Arc::clone(&self.cancels),
            records_handled: Arc::clone(&self.records_handled),
            started_at_ms: now_millis(),
            forward: forward_tx,
            results: results_tx.clone(),
        };
        self.spawn("handler", move || handler.run(reader))?;

        let writer = writer::Writer::new(self.id.clone(), log, Arc::clone(&self.services.filter));
        self.spawn("writer", move || writer.run(forward_rx, send_tx))?;

        let sender = sender::RecordSender::new(
            self.id.clone(),
            &settings,
            &self.services,
            Arc::clone(&self.run_work),
            Arc::clone(&self.cancels),
            self.abort.clone(),
            results_tx,
        );
        self.spawn("sender", move || sender.run(send_rx))?;

        let stream_id = self.id.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let mailbox = self.mailbox.clone();
        self.spawn("dispatch", move || {
            run_dispatch(&stream_id, results_rx, &dispatcher, &mailbox)
        })?;

        if let Some(log) = replay {
            let stream_id = self.id.clone();
            let run_work = Arc::clone(&self.run_work);
            self.spawn("replay", move || replay::replay_log(&stream_id, log, &run_work))?;
        }

        tracing::info!(
            stream_id = %self.id,
            replay = settings.is_replay(),
            transaction_log = !settings.skip_transaction_log,
            "stream: started"
        );
        Ok(())
    }

    /// Queues `record` for processing, blocking while the queue is full.
    pub fn handle_record(&self, mut record: Record) -> Result<(), StreamError> {
        if record.stream_id.is_empty() {
            record.stream_id = self.id.clone();
        }
        tracing::debug!(stream_id = %self.id, kind = record.kind_name(), "stream: handling record");
        let before_end = self.run_work.before_end();
        self.run_work.add_or_cancel(&before_end, record)?;
        Ok(())
    }

    /// Queues `record` and returns a handle for its result, for callers
    /// inside the service.
    pub fn deliver(&self, mut record: Record) -> Result<MailboxHandle, StreamError> {
        record.control.local = true;
        record.control.req_resp = true;
        let handle = self.mailbox.deliver(&mut record);
        self.handle_record(record)?;
        Ok(handle)
    }

    pub fn add_responders(&self, entries: impl IntoIterator<Item = ResponderEntry>) {
        self.dispatcher.add_responders(entries);
    }

    pub fn remove_responder(&self, id: &str) -> bool {
        self.dispatcher.remove_responder(id)
    }

    pub fn update_settings(&self, settings: RunSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn settings(&self) -> RunSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn records_handled(&self) -> u64 {
        self.records_handled.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.run_work.is_done()
    }

    pub fn transaction_log_path(&self, settings: &RunSettings) -> PathBuf {
        match &settings.sync_dir {
            Some(dir) => dir.join(format!(
                "run-{}.{TRANSACTION_LOG_EXTENSION}",
                settings.run_id
            )),
            None => self.services.paths.transaction_log_path(&settings.run_id),
        }
    }

    /// Waits for every accepted record to be processed, then joins the
    /// pipeline threads.
    pub fn close(&self) {
        tracing::info!(stream_id = %self.id, "stream: closing");
        self.run_work.close();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(stream_id = %self.id, "stream: worker thread panicked");
            }
        }
        tracing::info!(stream_id = %self.id, "stream: closed");
    }

    /// Fails every in-flight and future backend call of this stream.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Queues an exit record, gives the sender up to `grace` to send it,
    /// then closes. Backend calls still pending after `grace` are aborted,
    /// including when a stalled queue kept the exit from being queued.
    pub fn finish_and_close(&self, exit_code: i32, grace: Duration) {
        if !self.settings().is_replay() && !self.run_work.is_done() {
            let deadline = Instant::now() + grace;
            let mut exit = Record::new(self.id.clone(), RecordKind::Exit(ExitRecord { exit_code }));
            exit.control.local = true;
            match self.run_work.add_timeout(exit, grace) {
                Ok(()) => {
                    // The sender marks the queue done once the exit is out.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !self.run_work.before_end().wait_timeout(remaining) {
                        tracing::warn!(stream_id = %self.id, "stream: exit not sent before timeout");
                        self.abort();
                    }
                }
                Err(RunWorkError::TimedOut { .. }) => {
                    tracing::warn!(stream_id = %self.id, "stream: queue stalled, exit not queued");
                    self.abort();
                }
                Err(err) => {
                    tracing::debug!(stream_id = %self.id, error = %err, "stream: exit not queued");
                }
            }
        }
        self.close();
    }

    fn spawn<F>(&self, worker: &'static str, body: F) -> Result<(), StreamError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("stream-{worker}"))
            .spawn(body)
            .map_err(|source| StreamError::Spawn {
                stream_id: self.id.clone(),
                worker,
                source,
            })?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }
}

fn run_dispatch(
    stream_id: &str,
    results: Receiver<RecordResult>,
    dispatcher: &Dispatcher,
    mailbox: &Mailbox,
) {
    for result in results.iter() {
        if result.control.local {
            if !mailbox.respond(&result) {
                tracing::warn!(
                    stream_id,
                    slot = %result.control.mailbox_slot,
                    "dispatch: no local waiter for result"
                );
            }
            continue;
        }
        dispatcher.handle_respond(result);
    }
    tracing::debug!(stream_id, "dispatch: finished");
}
