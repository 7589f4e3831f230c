use crate::record::Control;
use crate::runwork::RunWork;
use crate::txlog::LogReader;
use std::fs::File;

/// Feeds a previously written transaction log back through the stream so
/// the sender can deliver it again.
pub(super) fn replay_log(stream_id: &str, mut log: LogReader<File>, run_work: &RunWork) {
    let before_end = run_work.before_end();
    let mut replayed = 0u64;
    loop {
        let mut record = match log.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(stream_id, error = %err, "replay: stopped on unreadable record");
                break;
            }
        };
        // Replayed records answer to nobody.
        record.control = Control {
            local: true,
            ..Control::default()
        };
        record.stream_id = stream_id.to_string();
        if let Err(err) = run_work.add_or_cancel(&before_end, record) {
            tracing::debug!(stream_id, error = %err, "replay: stream stopped accepting records");
            break;
        }
        replayed += 1;
    }
    tracing::info!(stream_id, replayed, "replay: finished");
}
