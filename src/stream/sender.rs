use super::StreamServices;
use crate::artifacts::ArtifactBuilder;
use crate::cancel::CancelToken;
use crate::mailbox::CancelRegistry;
use crate::record::{
    AckResult, ArtifactRecord, ArtifactResult, ErrorCode, ErrorInfo, ExitResult, FileItem,
    FilesResult, Record, RecordKind, RecordResult, ResultKind, RunRecord, RunResult, RunSettings,
};
use crate::remote::{OfflineRemote, RemoteApi, RemoteError, RunIdentity, UploadTask};
use crate::runwork::RunWork;
use crossbeam::channel::{self, Receiver, Sender};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

/// Last stage: performs the backend side effects of each record and
/// produces its result.
pub(super) struct RecordSender {
    stream_id: String,
    identity: RunIdentity,
    remote: Arc<dyn RemoteApi>,
    services: StreamServices,
    run_work: Arc<RunWork>,
    cancels: Arc<CancelRegistry>,
    /// Aborts in-flight backend calls; fired only when the stream gives up.
    abort: CancelToken,
    results: Sender<RecordResult>,
}

impl RecordSender {
    pub(super) fn new(
        stream_id: String,
        settings: &RunSettings,
        services: &StreamServices,
        run_work: Arc<RunWork>,
        cancels: Arc<CancelRegistry>,
        abort: CancelToken,
        results: Sender<RecordResult>,
    ) -> Self {
        let remote: Arc<dyn RemoteApi> = if settings.offline {
            Arc::new(OfflineRemote::new())
        } else {
            Arc::clone(&services.remote)
        };
        Self {
            stream_id,
            identity: RunIdentity {
                entity: settings.entity.clone(),
                project: settings.project.clone(),
                run_id: settings.run_id.clone(),
            },
            remote,
            services: services.clone(),
            run_work,
            cancels,
            abort,
            results,
        }
    }

    pub(super) fn run(mut self, input: Receiver<Record>) {
        for record in input.iter() {
            self.send(record);
        }
        tracing::debug!(stream_id = %self.stream_id, "sender: finished");
    }

    fn send(&mut self, record: Record) {
        tracing::debug!(stream_id = %self.stream_id, kind = record.kind_name(), "sender: sending");
        let abort = self.abort.clone();
        let kind = match &record.kind {
            RecordKind::Run(run) => self.send_run(&record, run),
            RecordKind::Exit(exit) => {
                let error = self
                    .submit("exit", &serde_json::json!({ "exit_code": exit.exit_code }), &abort)
                    .err();
                self.respond(&record, ResultKind::Exit(ExitResult { error }));
                tracing::info!(stream_id = %self.stream_id, exit_code = exit.exit_code, "sender: run exited");
                self.run_work.set_done();
                return;
            }
            RecordKind::Files(files) => self.send_files(&files.files, &abort),
            RecordKind::Artifact(artifact) => self.send_artifact(artifact, &abort),
            RecordKind::Request(_) => {
                tracing::debug!(stream_id = %self.stream_id, "sender: request reached sender");
                ResultKind::Ack(AckResult::default())
            }
            RecordKind::History(_)
            | RecordKind::Summary(_)
            | RecordKind::Config(_)
            | RecordKind::Output(_) => {
                let error = match serde_json::to_value(&record.kind) {
                    Ok(payload) => self.submit(record.kind_name(), &payload, &abort).err(),
                    Err(err) => Some(ErrorInfo::new(ErrorCode::Internal, err.to_string())),
                };
                ResultKind::Ack(AckResult { error })
            }
        };
        self.respond(&record, kind);
    }

    fn send_run(&mut self, record: &Record, run: &RunRecord) -> ResultKind {
        if !run.run_id.is_empty() {
            self.identity.run_id = run.run_id.clone();
        }
        if !run.project.is_empty() {
            self.identity.project = run.project.clone();
        }
        if !run.entity.is_empty() {
            self.identity.entity = run.entity.clone();
        }

        let slot = record.control.mailbox_slot.clone();
        let cancel = if slot.is_empty() {
            self.abort.clone()
        } else {
            // A client that gives up on the upsert has no use for the run.
            let run_work = Arc::clone(&self.run_work);
            self.cancels.add(
                slot.clone(),
                Some(&self.abort),
                Some(Box::new(move || run_work.set_done())),
            )
        };

        let error = match serde_json::to_value(run) {
            Ok(payload) => self.submit("run", &payload, &cancel).err(),
            Err(err) => Some(ErrorInfo::new(ErrorCode::Internal, err.to_string())),
        };
        if !slot.is_empty() {
            self.cancels.remove(&slot);
        }
        ResultKind::Run(RunResult {
            run_id: self.identity.run_id.clone(),
            error,
        })
    }

    fn send_files(&self, files: &[FileItem], cancel: &CancelToken) -> ResultKind {
        let entries = files
            .iter()
            .map(|file| (file.path.clone(), file.local_path.clone()))
            .collect::<Vec<_>>();
        let (uploaded, error) = self.upload(&entries, cancel);
        ResultKind::Files(FilesResult { uploaded, error })
    }

    fn send_artifact(&self, record: &ArtifactRecord, cancel: &CancelToken) -> ResultKind {
        let mut builder = match ArtifactBuilder::from_record(&self.services.paths.staging_dir(), record) {
            Ok(builder) => builder,
            Err(err) => {
                tracing::warn!(stream_id = %self.stream_id, error = %err, "sender: artifact rejected");
                return ResultKind::Artifact(ArtifactResult {
                    error: Some(ErrorInfo::new(ErrorCode::InvalidRequest, err.to_string())),
                    ..ArtifactResult::default()
                });
            }
        };
        let artifact = builder.get_artifact().clone();
        let mut result = ArtifactResult {
            digest: artifact.digest.clone(),
            entries: artifact.manifest.len(),
            error: None,
        };

        let payload = match serde_json::to_value(&artifact) {
            Ok(payload) => payload,
            Err(err) => {
                result.error = Some(ErrorInfo::new(ErrorCode::Internal, err.to_string()));
                return ResultKind::Artifact(result);
            }
        };
        if let Err(error) = self.submit("artifact", &payload, cancel) {
            result.error = Some(error);
            return ResultKind::Artifact(result);
        }

        let entries = artifact
            .manifest
            .contents
            .values()
            .filter_map(|entry| {
                entry.local_path.clone().map(|local| {
                    (format!("artifacts/{}/{}", artifact.name, entry.path), local)
                })
            })
            .collect::<Vec<_>>();
        let (_, error) = self.upload(&entries, cancel);
        result.error = error;
        tracing::info!(
            stream_id = %self.stream_id,
            artifact = %artifact.name,
            digest = %artifact.digest,
            "sender: artifact saved"
        );
        ResultKind::Artifact(result)
    }

    /// Uploads `(path, local file)` pairs on a bounded worker pool, each
    /// call gated by the shared limiter. Returns the uploaded paths and the
    /// first failure.
    fn upload(
        &self,
        entries: &[(String, PathBuf)],
        cancel: &CancelToken,
    ) -> (Vec<String>, Option<ErrorInfo>) {
        if entries.is_empty() {
            return (Vec::new(), None);
        }
        let paths = entries.iter().map(|(path, _)| path.clone()).collect::<Vec<_>>();
        let urls = match self.with_permit(cancel, |remote| {
            remote.signed_upload_urls(&self.identity, &paths, cancel)
        }) {
            Ok(urls) => urls,
            Err(err) => return (Vec::new(), Some(self.failure("upload_urls", &err))),
        };

        let mut tasks = Vec::with_capacity(entries.len());
        let mut first_error = None;
        for (path, local_path) in entries {
            match urls.urls.get(path) {
                Some(url) => tasks.push(UploadTask {
                    path: path.clone(),
                    local_path: local_path.clone(),
                    url: url.clone(),
                }),
                None => {
                    first_error.get_or_insert_with(|| {
                        ErrorInfo::new(
                            ErrorCode::Communication,
                            format!("no upload url issued for {path}"),
                        )
                    });
                }
            }
        }

        let (outcomes, lost) = self.run_uploads(&tasks, cancel);
        if lost > 0 {
            first_error.get_or_insert_with(|| {
                ErrorInfo::new(
                    ErrorCode::Internal,
                    format!("{lost} uploads lost to a panicked worker"),
                )
            });
        }

        let mut uploaded = Vec::new();
        for (path, outcome) in outcomes {
            match outcome {
                Ok(bytes) => {
                    tracing::debug!(stream_id = %self.stream_id, path = %path, bytes, "sender: uploaded");
                    uploaded.push(path);
                }
                Err(err) => {
                    let info = self.failure("upload", &err);
                    first_error.get_or_insert(info);
                }
            }
        }
        (uploaded, first_error)
    }

    /// Runs `tasks` on at most `limiter.capacity()` scoped workers and
    /// returns the outcomes in task order, plus how many went missing
    /// because a worker panicked.
    fn run_uploads(
        &self,
        tasks: &[UploadTask],
        cancel: &CancelToken,
    ) -> (Vec<(String, Result<u64, RemoteError>)>, usize) {
        let transfer = self.services.transfer.as_ref();
        let upload_one = |task: &UploadTask| {
            self.with_permit(cancel, |remote| transfer.upload(remote, task, cancel))
        };

        let (task_tx, task_rx) = channel::unbounded();
        for entry in tasks.iter().enumerate() {
            let _ = task_tx.send(entry);
        }
        drop(task_tx);
        let (outcome_tx, outcome_rx) = channel::unbounded();

        let workers = self.services.limiter.capacity().min(tasks.len());
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for index in 0..workers {
                let task_rx = task_rx.clone();
                let outcome_tx = outcome_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("stream-upload-{index}"))
                    .spawn_scoped(scope, move || {
                        for (position, task) in task_rx.iter() {
                            let _ = outcome_tx.send((position, upload_one(task)));
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        tracing::warn!(stream_id = %self.stream_id, error = %err, "sender: upload worker not spawned");
                        break;
                    }
                }
            }
            if handles.is_empty() {
                for (position, task) in task_rx.iter() {
                    let _ = outcome_tx.send((position, upload_one(task)));
                }
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!(stream_id = %self.stream_id, "sender: upload worker panicked");
                }
            }
        });
        drop(outcome_tx);

        let mut outcomes = outcome_rx.iter().collect::<Vec<_>>();
        outcomes.sort_by_key(|(position, _)| *position);
        let lost = tasks.len() - outcomes.len();
        let outcomes = outcomes
            .into_iter()
            .map(|(position, outcome)| (tasks[position].path.clone(), outcome))
            .collect();
        (outcomes, lost)
    }

    fn submit(&self, kind: &str, payload: &Value, cancel: &CancelToken) -> Result<(), ErrorInfo> {
        self.with_permit(cancel, |remote| remote.submit_metadata(kind, payload, cancel))
            .map_err(|err| self.failure(kind, &err))
    }

    fn with_permit<T>(
        &self,
        cancel: &CancelToken,
        call: impl FnOnce(&dyn RemoteApi) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let _permit = self.services.limiter.acquire(cancel)?;
        call(self.remote.as_ref())
    }

    fn failure(&self, operation: &str, err: &RemoteError) -> ErrorInfo {
        if err.is_canceled() {
            tracing::debug!(stream_id = %self.stream_id, operation, "sender: canceled");
            return ErrorInfo::canceled();
        }
        tracing::warn!(stream_id = %self.stream_id, operation, error = %err, "sender: remote call failed");
        ErrorInfo::new(ErrorCode::Communication, err.to_string())
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
            tracing::warn!(stream_id = %self.stream_id, "sender: dispatch gone, result dropped");
        }
    }
}
