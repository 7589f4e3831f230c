use runhub::record::{ExitRecord, HistoryRecord, Record, RecordKind};
use runhub::txlog::{LogReader, LogWriter, TxLogError, LOG_HEADER_LEN};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use tempfile::tempdir;

fn history(step: i64) -> Record {
    Record::new(
        "run-1",
        RecordKind::History(HistoryRecord {
            step,
            ..HistoryRecord::default()
        }),
    )
}

#[test]
fn reader_tails_a_log_that_is_still_being_written() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("runs/run-1/run-run-1.rhl");
    let mut writer = LogWriter::create(&path).expect("create");
    writer.append(&history(1)).expect("append");
    writer.append(&history(2)).expect("append");
    writer.flush().expect("flush");

    let mut reader = LogReader::open(&path).expect("open");
    assert_eq!(reader.read_to_end().expect("read"), vec![history(1), history(2)]);
    assert!(reader.next_record().expect("tail").is_none());

    writer
        .append(&Record::new("run-1", RecordKind::Exit(ExitRecord { exit_code: 0 })))
        .expect("append exit");
    writer.flush().expect("flush");
    let next = reader.next_record().expect("read").expect("exit record");
    assert_eq!(next.kind_name(), "exit");
    assert_eq!(writer.records_written(), 3);
}

#[test]
fn partially_written_record_is_retried_once_complete() {
    let dir = tempdir().expect("tempdir");
    let full_path = dir.path().join("full.rhl");
    let mut writer = LogWriter::create(&full_path).expect("create");
    writer.append(&history(1)).expect("append");
    writer.append(&history(2)).expect("append");
    writer.flush().expect("flush");
    let bytes = fs::read(&full_path).expect("read log");

    let mut scan = LogReader::from_reader(Cursor::new(bytes.clone()), "scan").expect("scan");
    scan.next_record().expect("first").expect("record");
    let second_start = scan.offset() as usize;
    let split = second_start + (bytes.len() - second_start) / 2;

    let tail_path = dir.path().join("tail.rhl");
    fs::write(&tail_path, &bytes[..split]).expect("write prefix");
    let mut reader = LogReader::open(&tail_path).expect("open");
    assert_eq!(reader.next_record().expect("first"), Some(history(1)));
    assert!(reader.next_record().expect("incomplete").is_none());
    assert_eq!(reader.offset() as usize, second_start);

    let mut file = OpenOptions::new()
        .append(true)
        .open(&tail_path)
        .expect("reopen");
    file.write_all(&bytes[split..]).expect("write rest");
    file.flush().expect("flush");
    assert_eq!(reader.next_record().expect("second"), Some(history(2)));
    assert!(reader.next_record().expect("end").is_none());
}

#[test]
fn checksum_mismatch_reports_the_record_offset() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("corrupt.rhl");
    let mut writer = LogWriter::create(&path).expect("create");
    writer.append(&history(1)).expect("append");
    writer.append(&history(2)).expect("append");
    writer.flush().expect("flush");

    let mut bytes = fs::read(&path).expect("read");
    let last = bytes.len() - 2;
    bytes[last] ^= 0xFF;

    let mut reader = LogReader::from_reader(Cursor::new(bytes), "corrupt").expect("open");
    assert_eq!(reader.next_record().expect("first"), Some(history(1)));
    let second_start = reader.offset();
    let err = reader.next_record().expect_err("corrupt");
    assert!(matches!(err, TxLogError::Corrupt { offset, .. } if offset == second_start));
}

#[test]
fn foreign_files_are_rejected_by_header() {
    let err = LogReader::from_reader(Cursor::new(b"SQLite format 3".to_vec()), "foreign")
        .err()
        .expect("bad header");
    assert!(matches!(err, TxLogError::BadHeader { .. }));

    let err = LogReader::from_reader(Cursor::new(vec![0u8; LOG_HEADER_LEN - 1]), "short")
        .err()
        .expect("short header");
    assert!(matches!(err, TxLogError::BadHeader { .. }));
}
