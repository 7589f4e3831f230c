use runhub::cancel::CancelToken;
use runhub::record::{HistoryRecord, Record, RecordKind};
use runhub::runwork::{RunWork, RunWorkError, RunWorkState};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn history(step: i64) -> Record {
    Record::new(
        "run-1",
        RecordKind::History(HistoryRecord {
            step,
            ..HistoryRecord::default()
        }),
    )
}

fn step_of(record: &Record) -> i64 {
    match &record.kind {
        RecordKind::History(history) => history.step,
        _ => -1,
    }
}

#[test]
fn slow_reader_applies_backpressure_without_reordering() {
    let work = Arc::new(RunWork::new("run-1", 2));
    let reader = work.reader().expect("reader");
    let consumer = thread::spawn(move || {
        let mut seen = Vec::new();
        for record in reader.iter() {
            if seen.len() % 10 == 0 {
                thread::sleep(Duration::from_millis(2));
            }
            seen.push(step_of(&record));
        }
        seen
    });

    let producer = {
        let work = Arc::clone(&work);
        thread::spawn(move || {
            for step in 0..100 {
                work.add(history(step)).expect("add");
            }
        })
    };
    producer.join().expect("join producer");
    work.close();

    let seen = consumer.join().expect("join consumer");
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    assert_eq!(work.state(), RunWorkState::Closed);
}

#[test]
fn blocked_producer_is_released_by_set_done() {
    let work = Arc::new(RunWork::new("run-1", 1));
    work.add(history(0)).expect("fill");

    let blocked = {
        let work = Arc::clone(&work);
        thread::spawn(move || {
            let before_end = work.before_end();
            work.add_or_cancel(&before_end, history(1))
        })
    };
    thread::sleep(Duration::from_millis(20));
    work.set_done();

    let outcome = blocked.join().expect("join blocked producer");
    assert!(matches!(
        outcome,
        Err(RunWorkError::Canceled { .. } | RunWorkError::Done { .. })
    ));
    let reader = work.reader().expect("reader");
    assert_eq!(reader.iter().map(|r| step_of(&r)).collect::<Vec<_>>(), vec![0]);
}

#[test]
fn already_canceled_token_rejects_immediately() {
    let work = RunWork::new("run-1", 4);
    let done = CancelToken::new();
    done.cancel();
    assert!(matches!(
        work.add_or_cancel(&done, history(1)),
        Err(RunWorkError::Canceled { .. })
    ));
}

#[test]
fn close_waits_for_the_reader_to_drain() {
    let work = Arc::new(RunWork::new("run-1", 8));
    for step in 0..5 {
        work.add(history(step)).expect("add");
    }
    let reader = work.reader().expect("reader");
    let consumer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        reader.iter().count()
    });
    work.close();
    assert_eq!(consumer.join().expect("join"), 5);
}

#[test]
fn concurrent_queues_each_keep_their_own_order() {
    const QUEUES: usize = 8;
    const RECORDS: i64 = 200;

    let queues = (0..QUEUES)
        .map(|index| Arc::new(RunWork::new(format!("run-{index}"), 3)))
        .collect::<Vec<_>>();
    let consumers = queues
        .iter()
        .map(|work| {
            let reader = work.reader().expect("reader");
            thread::spawn(move || {
                reader
                    .iter()
                    .map(|record| (record.stream_id.clone(), step_of(&record)))
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();
    let producers = queues
        .iter()
        .enumerate()
        .map(|(index, work)| {
            let work = Arc::clone(work);
            thread::spawn(move || {
                for step in 0..RECORDS {
                    let mut record = history(step);
                    record.stream_id = format!("run-{index}");
                    work.add(record).expect("add");
                }
                work.set_done();
            })
        })
        .collect::<Vec<_>>();

    for producer in producers {
        producer.join().expect("join producer");
    }
    for (index, consumer) in consumers.into_iter().enumerate() {
        let seen = consumer.join().expect("join consumer");
        let expected_id = format!("run-{index}");
        assert!(seen.iter().all(|(stream_id, _)| *stream_id == expected_id));
        assert_eq!(
            seen.into_iter().map(|(_, step)| step).collect::<Vec<_>>(),
            (0..RECORDS).collect::<Vec<_>>()
        );
    }
    for work in &queues {
        work.close();
    }
}
