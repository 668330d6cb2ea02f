use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Barrier;
use std::thread;

use mapdump::append_log::PAGE_SIZE;
use mapdump::{AppendLog, LogConfig};

#[test]
fn closed_file_is_exactly_the_reserved_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    let mut log = AppendLog::create(&path, 1024).unwrap();

    log.ensure(10).unwrap();
    let (a, offset_a) = log.reserve(4);
    a.copy_from_slice(b"abcd");
    let (b, offset_b) = log.reserve(6);
    b.copy_from_slice(b"efghij");
    assert_eq!((offset_a, offset_b), (0, 4));

    assert_eq!(log.close().unwrap(), 10);
    assert_eq!(fs::read(&path).unwrap(), b"abcdefghij");
}

#[test]
fn records_survive_several_grows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    let mut log = AppendLog::create(&path, 0).unwrap();
    let mut expected = Vec::new();

    for round in 0..50u8 {
        let record = vec![round; 1000];
        log.ensure(record.len()).unwrap();
        log.write(&record);
        expected.extend_from_slice(&record);
    }
    assert!(log.capacity() >= expected.len());
    assert_eq!(log.as_bytes(), expected.as_slice());
    log.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), expected);
}

#[test]
fn concurrent_reservations_are_disjoint() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    let mut log = AppendLog::create(&path, 0).unwrap();
    log.ensure(THREADS * PER_THREAD * 8).unwrap();

    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for t in 0..THREADS {
            let log = &log;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let (bytes, _) = log.reserve(8);
                    bytes.copy_from_slice(&((t * PER_THREAD + i) as u64).to_le_bytes());
                }
            });
        }
    });
    assert_eq!(log.used(), THREADS * PER_THREAD * 8);
    log.close().unwrap();

    let mut ids: Vec<u64> = fs::read(&path)
        .unwrap()
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    ids.sort_unstable();
    assert!(ids.iter().enumerate().all(|(i, &id)| id == i as u64));
}

#[test]
fn sync_does_not_change_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    let log = AppendLog::create(&path, 64).unwrap();
    log.write(b"durable");
    log.sync().unwrap();
    log.write(b"!");
    assert_eq!(log.close().unwrap(), 8);
    assert_eq!(fs::read(&path).unwrap(), b"durable!");
}

#[test]
fn dropping_without_close_still_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    {
        let log = AppendLog::create(&path, 1 << 16).unwrap();
        log.write(b"partial");
    }
    assert_eq!(fs::read(&path).unwrap(), b"partial");
}

#[test]
fn create_truncates_an_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    fs::write(&path, vec![7u8; 3 * PAGE_SIZE]).unwrap();

    let log = AppendLog::with_config(&path, &LogConfig::with_capacity(16)).unwrap();
    assert_eq!(log.capacity(), 16);
    assert_eq!(log.close().unwrap(), 0);
    assert!(fs::read(&path).unwrap().is_empty());
}

#[test]
fn create_in_a_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = AppendLog::create(dir.path().join("missing").join("records"), 64);
    assert!(matches!(result, Err(mapdump::Error::Io { .. })));
}

#[test]
#[should_panic(expected = "overflow")]
fn reserving_past_capacity_panics() {
    let dir = tempfile::tempdir().unwrap();
    let log = AppendLog::create(dir.path().join("records"), PAGE_SIZE).unwrap();
    log.reserve(PAGE_SIZE);
    log.reserve(1);
}

#[test]
#[should_panic(expected = "zero length")]
fn zero_length_reservation_panics() {
    let dir = tempfile::tempdir().unwrap();
    let log = AppendLog::create(dir.path().join("records"), 64).unwrap();
    log.reserve(0);
}

#[test]
fn close_after_an_overflow_reports_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    let log = AppendLog::create(&path, 8).unwrap();
    log.write(b"fits");

    assert!(panic::catch_unwind(AssertUnwindSafe(|| log.reserve(16).1)).is_err());

    match log.close() {
        Err(mapdump::Error::Overflow { used, capacity, .. }) => {
            assert_eq!((used, capacity), (20, 8));
        }
        other => panic!("expected an overflow error, got {:?}", other),
    }
    assert_eq!(fs::read(&path).unwrap().len(), 8);
}

#[test]
fn failed_growth_is_reported_and_leaves_the_log_usable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records");
    let mut log = AppendLog::create(&path, 64).unwrap();
    log.write(b"kept");

    let result = log.ensure(usize::MAX / 2);
    assert!(matches!(result, Err(mapdump::Error::Io { .. })));
    assert_eq!(log.capacity(), 64);

    log.write(b" too");
    assert_eq!(log.close().unwrap(), 8);
    assert_eq!(fs::read(&path).unwrap(), b"kept too");
}
