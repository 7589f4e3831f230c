use crossbeam::channel::{self, Sender};
use runhub::artifacts::{entry_digest, MANIFEST_DIGEST_PREFIX};
use runhub::cancel::CancelToken;
use runhub::config::Settings;
use runhub::record::{
    ArtifactData, ArtifactRecord, ErrorCode, ExitRecord, FileItem, FilesRecord, FilesResult,
    HistoryRecord, Record, RecordKind, Request, ResultKind, RunRecord, RunSettings,
};
use runhub::remote::{ConcurrencyLimiter, RemoteApi, RemoteError, RunIdentity, UploadUrls};
use runhub::runtime::{bootstrap_state_root, StatePaths};
use runhub::stream::{Stream, StreamError, StreamMux, StreamServices};
use runhub::txlog::LogReader;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_secs(5);

fn services(dir: &TempDir) -> StreamServices {
    let paths = StatePaths::new(dir.path().join("state"));
    bootstrap_state_root(&paths).expect("bootstrap");
    StreamServices::new(paths, &Settings::default())
}

fn history(step: i64) -> Record {
    Record::new(
        "",
        RecordKind::History(HistoryRecord {
            step,
            ..HistoryRecord::default()
        }),
    )
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        assert!(started.elapsed() < WAIT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Remote that records every submitted kind.
#[derive(Default)]
struct Recording {
    kinds: Mutex<Vec<String>>,
}

impl Recording {
    fn kinds(&self) -> Vec<String> {
        self.kinds.lock().expect("lock").clone()
    }
}

impl RemoteApi for Recording {
    fn submit_metadata(
        &self,
        kind: &str,
        _payload: &Value,
        cancel: &CancelToken,
    ) -> Result<(), RemoteError> {
        cancel.check()?;
        self.kinds.lock().expect("lock").push(kind.to_string());
        Ok(())
    }

    fn signed_upload_urls(
        &self,
        _run: &RunIdentity,
        _files: &[String],
        _cancel: &CancelToken,
    ) -> Result<UploadUrls, RemoteError> {
        Ok(UploadUrls::default())
    }

    fn upload_bytes(&self, _url: &str, _data: &[u8], _cancel: &CancelToken) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Remote whose `hang_on` submissions block until their cancel token fires.
struct Hanging {
    hang_on: &'static str,
    entered: Sender<()>,
}

impl RemoteApi for Hanging {
    fn submit_metadata(
        &self,
        kind: &str,
        _payload: &Value,
        cancel: &CancelToken,
    ) -> Result<(), RemoteError> {
        if kind == self.hang_on {
            let _ = self.entered.try_send(());
            cancel.wait();
            return Err(RemoteError::Canceled);
        }
        cancel.check()?;
        Ok(())
    }

    fn signed_upload_urls(
        &self,
        _run: &RunIdentity,
        _files: &[String],
        cancel: &CancelToken,
    ) -> Result<UploadUrls, RemoteError> {
        cancel.check()?;
        Ok(UploadUrls::default())
    }

    fn upload_bytes(&self, _url: &str, _data: &[u8], cancel: &CancelToken) -> Result<(), RemoteError> {
        cancel.check()?;
        Ok(())
    }
}

/// Remote that signs a `mem://` URL for every file not in `withheld` and
/// keeps what was uploaded, and by which thread.
#[derive(Default)]
struct Uploading {
    withheld: Vec<String>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    upload_threads: Mutex<HashSet<String>>,
}

impl Uploading {
    fn withholding(path: &str) -> Self {
        Self {
            withheld: vec![path.to_string()],
            ..Self::default()
        }
    }

    fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().expect("lock").clone()
    }
}

impl RemoteApi for Uploading {
    fn submit_metadata(
        &self,
        _kind: &str,
        _payload: &Value,
        cancel: &CancelToken,
    ) -> Result<(), RemoteError> {
        cancel.check()?;
        Ok(())
    }

    fn signed_upload_urls(
        &self,
        _run: &RunIdentity,
        files: &[String],
        cancel: &CancelToken,
    ) -> Result<UploadUrls, RemoteError> {
        cancel.check()?;
        let urls = files
            .iter()
            .filter(|file| !self.withheld.contains(file))
            .map(|file| (file.clone(), format!("mem://{file}")))
            .collect();
        Ok(UploadUrls {
            urls,
            live_steps: None,
        })
    }

    fn upload_bytes(&self, url: &str, data: &[u8], cancel: &CancelToken) -> Result<(), RemoteError> {
        cancel.check()?;
        let worker = thread::current().name().unwrap_or("unnamed").to_string();
        self.upload_threads.lock().expect("lock").insert(worker);
        thread::sleep(Duration::from_millis(2));
        self.uploads
            .lock()
            .expect("lock")
            .push((url.to_string(), data.to_vec()));
        Ok(())
    }
}

fn write_files(dir: &TempDir, names: &[&str]) -> Vec<FileItem> {
    names
        .iter()
        .map(|name| {
            let local_path = dir.path().join(name);
            fs::write(&local_path, format!("contents of {name}")).expect("write file");
            FileItem {
                path: name.to_string(),
                local_path,
            }
        })
        .collect()
}

fn files_result(stream: &Stream, files: Vec<FileItem>) -> FilesResult {
    let result = stream
        .deliver(Record::new("", RecordKind::Files(FilesRecord { files })))
        .expect("deliver files")
        .wait_timeout(WAIT)
        .expect("files result");
    let ResultKind::Files(files) = result.kind else {
        panic!("expected files result, got {:?}", result.kind);
    };
    files
}

fn upload_stream(dir: &TempDir, id: &str, remote: Arc<Uploading>) -> Stream {
    let mut settings = RunSettings::new(id);
    settings.skip_transaction_log = true;
    let stream = Stream::new(id, settings, services(dir).with_remote(remote));
    stream.start().expect("start");
    stream
}

#[test]
fn status_request_reports_progress_through_the_mailbox() {
    let dir = tempdir().expect("tempdir");
    let mut settings = RunSettings::new("run-status");
    settings.skip_transaction_log = true;
    let stream = Stream::new("run-status", settings, services(&dir));
    stream.start().expect("start");

    stream.handle_record(history(1)).expect("history");
    stream.handle_record(history(2)).expect("history");
    let handle = stream
        .deliver(Record::new("", RecordKind::Request(Request::Status)))
        .expect("deliver");
    let result = handle.wait_timeout(WAIT).expect("status result");
    let ResultKind::Status(status) = result.kind else {
        panic!("expected status result, got {:?}", result.kind);
    };
    assert_eq!(status.stream_id, "run-status");
    assert_eq!(status.records_handled, 3);
    assert!(!status.done);
    assert!(status.started_at_ms > 0);

    stream.close();
    assert!(stream.is_done());
}

#[test]
fn finish_logs_every_record_and_replay_resends_them() {
    let dir = tempdir().expect("tempdir");
    let first = Arc::new(Recording::default());
    let stream = Stream::new(
        "run-a",
        RunSettings::new("run-a"),
        services(&dir).with_remote(first.clone()),
    );
    stream.start().expect("start");
    for step in 0..3 {
        stream.handle_record(history(step)).expect("history");
    }
    stream.finish_and_close(0, WAIT);
    assert_eq!(first.kinds(), vec!["history", "history", "history", "exit"]);

    let log_path = stream.transaction_log_path(&stream.settings());
    let logged = LogReader::open(&log_path)
        .expect("open log")
        .read_to_end()
        .expect("read log");
    assert_eq!(
        logged.iter().map(Record::kind_name).collect::<Vec<_>>(),
        vec!["history", "history", "history", "exit"]
    );
    assert!(logged.iter().all(|record| record.stream_id == "run-a"));

    let second = Arc::new(Recording::default());
    let mut replay_settings = RunSettings::new("run-a");
    replay_settings.replay_file = Some(log_path);
    let replay = Stream::new(
        "run-a-replay",
        replay_settings,
        services(&dir).with_remote(second.clone()),
    );
    replay.start().expect("start replay");
    wait_until("replayed exit", || replay.is_done());
    replay.close();
    assert_eq!(second.kinds(), vec!["history", "history", "history", "exit"]);
}

#[test]
fn exit_result_is_returned_before_the_stream_stops_accepting() {
    let dir = tempdir().expect("tempdir");
    let mut settings = RunSettings::new("run-exit");
    settings.offline = true;
    let stream = Stream::new("run-exit", settings, services(&dir));
    stream.start().expect("start");

    let handle = stream
        .deliver(Record::new("", RecordKind::Exit(ExitRecord { exit_code: 2 })))
        .expect("deliver exit");
    let result = handle.wait_timeout(WAIT).expect("exit result");
    assert!(matches!(result.kind, ResultKind::Exit(ref exit) if exit.error.is_none()));

    wait_until("done", || stream.is_done());
    assert!(matches!(
        stream.handle_record(history(9)),
        Err(StreamError::RunWork(_))
    ));
    stream.close();
}

#[test]
fn canceling_a_hung_run_upsert_answers_and_stops_the_stream() {
    let dir = tempdir().expect("tempdir");
    let (entered_tx, entered_rx) = channel::bounded(1);
    let remote = Arc::new(Hanging {
        hang_on: "run",
        entered: entered_tx,
    });
    let mut settings = RunSettings::new("run-hang");
    settings.skip_transaction_log = true;
    let stream = Stream::new("run-hang", settings, services(&dir).with_remote(remote));
    stream.start().expect("start");

    let upsert = stream
        .deliver(Record::new(
            "",
            RecordKind::Run(RunRecord {
                run_id: "run-hang".to_string(),
                ..RunRecord::default()
            }),
        ))
        .expect("deliver run");
    entered_rx.recv_timeout(WAIT).expect("upsert started");

    let cancel = stream
        .deliver(Record::new(
            "",
            RecordKind::Request(Request::Cancel {
                cancel_slot: upsert.slot().to_string(),
            }),
        ))
        .expect("deliver cancel");
    assert!(matches!(
        cancel.wait_timeout(WAIT).expect("cancel ack").kind,
        ResultKind::Ack(_)
    ));

    let result = upsert.wait_timeout(WAIT).expect("run result");
    assert!(result.is_canceled());
    let ResultKind::Run(run) = &result.kind else {
        panic!("expected run result");
    };
    assert_eq!(run.run_id, "run-hang");
    assert!(stream.is_done());
    stream.close();
}

#[test]
fn start_rejects_unusable_run_ids() {
    let dir = tempdir().expect("tempdir");
    let stream = Stream::new("bad", RunSettings::new("../escape"), services(&dir));
    assert!(matches!(
        stream.start(),
        Err(StreamError::InvalidSettings { .. })
    ));
}

#[test]
fn mux_tracks_streams_by_id() {
    let dir = tempdir().expect("tempdir");
    let mux = StreamMux::new();
    let mut settings = RunSettings::new("run-m");
    settings.skip_transaction_log = true;
    settings.offline = true;
    let stream = Arc::new(Stream::new("run-m", settings.clone(), services(&dir)));
    stream.start().expect("start");
    mux.add_stream(Arc::clone(&stream)).expect("add");

    let duplicate = Arc::new(Stream::new("run-m", settings, services(&dir)));
    assert!(matches!(
        mux.add_stream(duplicate),
        Err(StreamError::Duplicate { .. })
    ));
    assert_eq!(mux.stream_ids(), vec!["run-m".to_string()]);
    assert!(matches!(
        mux.get_stream("missing"),
        Err(StreamError::NotFound { .. })
    ));

    mux.finish_and_close_all(0, WAIT);
    assert!(mux.is_empty());
    assert!(stream.is_done());
}

#[test]
fn offline_runs_never_touch_the_configured_remote() {
    let dir = tempdir().expect("tempdir");
    let configured = Arc::new(Recording::default());
    let mut settings = RunSettings::new("run-off");
    settings.offline = true;
    settings.skip_transaction_log = true;
    let stream = Stream::new(
        "run-off",
        settings,
        services(&dir).with_remote(configured.clone()),
    );
    stream.start().expect("start");
    stream.handle_record(history(1)).expect("history");
    stream.finish_and_close(0, WAIT);
    assert!(configured.kinds().is_empty());
}

#[test]
fn finish_gives_up_on_a_queue_stalled_behind_a_hung_call() {
    let dir = tempdir().expect("tempdir");
    let (entered_tx, entered_rx) = channel::bounded(1);
    let remote = Arc::new(Hanging {
        hang_on: "history",
        entered: entered_tx,
    });
    let mut services = services(&dir).with_remote(remote);
    services.queue_capacity = 1;
    let mut settings = RunSettings::new("run-stall");
    settings.skip_transaction_log = true;
    let stream = Arc::new(Stream::new("run-stall", settings, services));
    stream.start().expect("start");

    let producer = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            for step in 0..20 {
                let _ = stream.handle_record(history(step));
            }
        })
    };
    entered_rx.recv_timeout(WAIT).expect("history submit hung");
    thread::sleep(Duration::from_millis(50));

    let (closed_tx, closed_rx) = channel::bounded(1);
    let closer = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || {
            stream.finish_and_close(0, Duration::from_millis(200));
            let _ = closed_tx.send(());
        })
    };
    closed_rx
        .recv_timeout(WAIT)
        .expect("finish_and_close returned after its grace period");
    closer.join().expect("join closer");
    producer.join().expect("join producer");
    assert!(stream.is_done());
}

#[test]
fn files_are_uploaded_to_their_signed_urls() {
    let dir = tempdir().expect("tempdir");
    let remote = Arc::new(Uploading::default());
    let stream = upload_stream(&dir, "run-files", remote.clone());

    let files = files_result(&stream, write_files(&dir, &["a.txt", "b.txt"]));
    assert_eq!(files.uploaded, vec!["a.txt".to_string(), "b.txt".to_string()]);
    assert!(files.error.is_none());

    let mut uploads = remote.uploads();
    uploads.sort();
    assert_eq!(
        uploads,
        vec![
            ("mem://a.txt".to_string(), b"contents of a.txt".to_vec()),
            ("mem://b.txt".to_string(), b"contents of b.txt".to_vec()),
        ]
    );
    stream.close();
}

#[test]
fn file_without_a_signed_url_is_reported_and_the_rest_still_upload() {
    let dir = tempdir().expect("tempdir");
    let remote = Arc::new(Uploading::withholding("b.txt"));
    let stream = upload_stream(&dir, "run-missing", remote.clone());

    let files = files_result(&stream, write_files(&dir, &["a.txt", "b.txt"]));
    assert_eq!(files.uploaded, vec!["a.txt".to_string()]);
    let error = files.error.expect("missing url error");
    assert_eq!(error.code, ErrorCode::Communication);
    assert!(error.message.contains("b.txt"));
    assert_eq!(remote.uploads().len(), 1);
    stream.close();
}

#[test]
fn aborted_stream_reports_uploads_as_canceled() {
    let dir = tempdir().expect("tempdir");
    let remote = Arc::new(Uploading::default());
    let stream = upload_stream(&dir, "run-aborted", remote.clone());

    stream.abort();
    let files = files_result(&stream, write_files(&dir, &["a.txt"]));
    assert!(files.uploaded.is_empty());
    assert_eq!(files.error.expect("canceled").code, ErrorCode::Canceled);
    assert!(remote.uploads().is_empty());
    stream.close();
}

#[test]
fn many_files_share_a_pool_no_larger_than_the_limiter() {
    let dir = tempdir().expect("tempdir");
    let remote = Arc::new(Uploading::default());
    let mut services = services(&dir).with_remote(remote.clone());
    services.limiter = ConcurrencyLimiter::new(2);
    let mut settings = RunSettings::new("run-many");
    settings.skip_transaction_log = true;
    let stream = Stream::new("run-many", settings, services);
    stream.start().expect("start");

    let names = (0..40).map(|index| format!("f{index:02}.txt")).collect::<Vec<_>>();
    let name_refs = names.iter().map(String::as_str).collect::<Vec<_>>();
    let files = files_result(&stream, write_files(&dir, &name_refs));
    assert_eq!(files.uploaded, names);
    assert!(files.error.is_none());
    assert_eq!(remote.uploads().len(), 40);
    assert!(remote.upload_threads.lock().expect("lock").len() <= 2);
    stream.close();
}

#[test]
fn artifact_result_carries_the_manifest_digest_and_entries_are_uploaded() {
    let dir = tempdir().expect("tempdir");
    let remote = Arc::new(Uploading::default());
    let stream = upload_stream(&dir, "run-artifact", remote.clone());

    let record = ArtifactRecord {
        name: "eval".to_string(),
        artifact_type: "results".to_string(),
        description: None,
        data: vec![ArtifactData {
            name: "junk.json".to_string(),
            payload: json!({"Junk": "junk"}),
        }],
    };
    let result = stream
        .deliver(Record::new("", RecordKind::Artifact(record)))
        .expect("deliver artifact")
        .wait_timeout(WAIT)
        .expect("artifact result");
    let ResultKind::Artifact(artifact) = result.kind else {
        panic!("expected artifact result, got {:?}", result.kind);
    };

    let expected = format!(
        "{:x}",
        md5::compute(format!(
            "{MANIFEST_DIGEST_PREFIX}junk.json:{}\n",
            entry_digest(br#"{"Junk":"junk"}"#)
        ))
    );
    assert_eq!(artifact.digest, expected);
    assert_eq!(artifact.entries, 1);
    assert!(artifact.error.is_none());
    assert_eq!(
        remote.uploads(),
        vec![(
            "mem://artifacts/eval/junk.json".to_string(),
            br#"{"Junk":"junk"}"#.to_vec()
        )]
    );
    stream.close();
}
