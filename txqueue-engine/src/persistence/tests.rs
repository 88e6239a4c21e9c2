use super::*;
use crate::core::types::{IdGenerator, ObjectId, Payload, SequentialIdGenerator, UuidGenerator};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn ids() -> Arc<dyn IdGenerator> {
    Arc::new(UuidGenerator)
}

fn journal_at(dir: &Path) -> JournalPersistenceStrategy {
    JournalPersistenceStrategy::new(
        JournalConfig {
            dir: dir.to_path_buf(),
            fsync_mode: FsyncMode::Never,
            fsync_interval: Duration::from_millis(100),
            buffer_size: 4096,
            // compaction driven by hand in these tests
            compaction_interval: Duration::ZERO,
        },
        ids(),
    )
}

fn log_at(dir: &Path, segment_size: u64) -> LogPersistenceStrategy {
    LogPersistenceStrategy::new(
        LogConfig {
            dir: dir.to_path_buf(),
            fsync_mode: FsyncMode::Never,
            fsync_interval: Duration::from_millis(100),
            buffer_size: 4096,
            segment_size,
            compaction_interval: Duration::ZERO,
        },
        ids(),
    )
}

fn file_at(dir: &Path) -> FilePersistenceStrategy {
    FilePersistenceStrategy::new(dir, "msg", false, ids())
}

fn durable_backends(dir: &Path) -> Vec<Box<dyn QueuePersistenceStrategy>> {
    vec![
        Box::new(file_at(&dir.join("file"))),
        Box::new(journal_at(&dir.join("journal"))),
        Box::new(log_at(&dir.join("log"), 4096)),
    ]
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let strategy = file_at(dir.path());
    strategy.open().unwrap();
    assert!(strategy.restore().unwrap().is_empty());
    let id = strategy.store(&Holder::new("greetings", "hello")).unwrap();
    strategy.close().unwrap();

    let reopened = file_at(dir.path());
    reopened.open().unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![id]);
    let holder = reopened.load(id).unwrap();
    assert_eq!(holder.queue, "greetings");
    assert_eq!(holder.payload, Payload::Text("hello".to_string()));
}

#[test]
fn test_log_remove_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let strategy = log_at(dir.path(), 4096);
    strategy.open().unwrap();
    strategy.restore().unwrap();
    let a = strategy.store(&Holder::new("orders", "item1")).unwrap();
    let b = strategy.store(&Holder::new("orders", "item2")).unwrap();
    strategy.remove(a).unwrap();
    strategy.close().unwrap();

    let reopened = log_at(dir.path(), 4096);
    reopened.open().unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![b]);
    assert_eq!(
        reopened.load(b).unwrap().payload.as_text(),
        Some("item2")
    );
    assert!(matches!(
        reopened.load(a),
        Err(PersistenceError::NotFound(_))
    ));
}

#[test]
fn test_restore_returns_store_order() {
    let dir = tempfile::tempdir().unwrap();

    for strategy in durable_backends(dir.path()) {
        strategy.open().unwrap();
        strategy.restore().unwrap();
        let stored: Vec<ObjectId> = (0..20)
            .map(|i| strategy.store(&Holder::new("q", format!("m{i}"))).unwrap())
            .collect();
        for id in stored.iter().step_by(3) {
            strategy.remove(*id).unwrap();
        }
        let expected: Vec<ObjectId> = stored
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(_, id)| *id)
            .collect();

        strategy.close().unwrap();
        strategy.open().unwrap();
        assert_eq!(strategy.restore().unwrap(), expected, "{}", strategy.name());
        strategy.close().unwrap();
    }
}

#[test]
fn test_restore_twice_agrees() {
    let dir = tempfile::tempdir().unwrap();

    for strategy in durable_backends(dir.path()) {
        strategy.open().unwrap();
        strategy.restore().unwrap();
        let a = strategy.store(&Holder::new("q", "a")).unwrap();
        let b = strategy.store(&Holder::new("q", vec![1u8, 2, 3])).unwrap();
        strategy.remove(a).unwrap();

        let first = strategy.restore().unwrap();
        let second = strategy.restore().unwrap();
        assert_eq!(first, vec![b], "{}", strategy.name());
        assert_eq!(first, second, "{}", strategy.name());
        assert_eq!(
            strategy.load(b).unwrap().payload.as_bytes(),
            Some(&[1u8, 2, 3][..])
        );
        strategy.close().unwrap();
    }
}

#[test]
fn test_remove_unknown_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = ObjectId::from_u128(0xdead);

    let memory = MemoryPersistenceStrategy::new(ids());
    memory.open().unwrap();
    assert!(memory.remove(missing).is_err());

    for strategy in durable_backends(dir.path()) {
        strategy.open().unwrap();
        strategy.restore().unwrap();
        assert!(strategy.remove(missing).is_err(), "{}", strategy.name());

        let id = strategy.store(&Holder::new("q", "once")).unwrap();
        strategy.remove(id).unwrap();
        assert!(strategy.remove(id).is_err(), "{}", strategy.name());
        strategy.close().unwrap();
    }
}

#[test]
fn test_file_delete_of_vanished_file() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = file_at(dir.path());
    strategy.open().unwrap();
    let id = strategy.store(&Holder::new("q", "x")).unwrap();

    fs::remove_file(dir.path().join("q").join(format!("{id}.msg"))).unwrap();
    assert!(matches!(
        strategy.remove(id),
        Err(PersistenceError::DeleteFailed { .. })
    ));
}

#[test]
fn test_file_restore_discards_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = file_at(dir.path());
    strategy.open().unwrap();
    let id = strategy.store(&Holder::new("q", "kept")).unwrap();

    let leftover = dir.path().join("q").join("half-written.msg.tmp");
    fs::write(&leftover, b"partial").unwrap();

    assert_eq!(strategy.restore().unwrap(), vec![id]);
    assert!(!leftover.exists());
}

#[test]
fn test_file_rejects_unsafe_queue_names() {
    let dir = tempfile::tempdir().unwrap();
    let strategy = file_at(dir.path());
    strategy.open().unwrap();
    assert!(matches!(
        strategy.store(&Holder::new("../escape", "x")),
        Err(PersistenceError::InvalidQueueName(_))
    ));
}

#[test]
fn test_memory_forgets_on_close() {
    let strategy = MemoryPersistenceStrategy::new(Arc::new(SequentialIdGenerator::new(1)));
    strategy.open().unwrap();
    let id = strategy.store(&Holder::new("q", "x")).unwrap();
    assert_eq!(id, ObjectId::from_u128(1));
    assert_eq!(strategy.len(), 1);
    assert!(strategy.restore().unwrap().is_empty());

    strategy.close().unwrap();
    assert!(strategy.is_empty());
}

#[test]
fn test_operations_after_close_fail() {
    let dir = tempfile::tempdir().unwrap();
    for strategy in durable_backends(dir.path()) {
        strategy.open().unwrap();
        strategy.close().unwrap();
        assert!(
            matches!(
                strategy.store(&Holder::new("q", "x")),
                Err(PersistenceError::Closed)
            ),
            "{}",
            strategy.name()
        );
    }
}

#[test]
fn test_journal_compaction_keeps_pending_records() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_at(dir.path());
    journal.open().unwrap();
    journal.restore().unwrap();

    let done: Vec<ObjectId> = (0..10)
        .map(|i| journal.store(&Holder::new("q", format!("done{i}"))).unwrap())
        .collect();
    let keep = journal.store(&Holder::new("q", "keep")).unwrap();
    for id in &done {
        journal.remove(*id).unwrap();
    }
    let size_before = fs::metadata(journal.path()).unwrap().len();

    // lsn 0..9 are deleted stores, lsn 10 is still pending
    assert_eq!(journal.low_water_mark(), 10);
    assert_eq!(journal.compact().unwrap(), 10);
    assert!(fs::metadata(journal.path()).unwrap().len() < size_before);
    assert_eq!(journal.compact().unwrap(), 0);

    // appends after the rewrite land in the new file
    let later = journal.store(&Holder::new("q", "later")).unwrap();
    journal.close().unwrap();

    let reopened = journal_at(dir.path());
    reopened.open().unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![keep, later]);
    assert_eq!(reopened.load(keep).unwrap().payload.as_text(), Some("keep"));
}

#[test]
fn test_journal_compaction_alongside_writers() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(journal_at(dir.path()));
    journal.open().unwrap();
    journal.restore().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let compactor = {
        let journal = Arc::clone(&journal);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reclaimed = 0;
            while !done.load(Ordering::SeqCst) {
                reclaimed += journal.compact().unwrap();
            }
            reclaimed
        })
    };

    let mut kept = Vec::new();
    for i in 0..500 {
        let id = journal.store(&Holder::new("q", format!("m{i}"))).unwrap();
        if i % 10 == 9 {
            kept.push(id);
        } else {
            journal.remove(id).unwrap();
        }
    }
    done.store(true, Ordering::SeqCst);
    let reclaimed = compactor.join().unwrap() + journal.compact().unwrap();
    assert!(reclaimed > 0);
    journal.close().unwrap();

    // frames appended while a rewrite was copying must all survive it
    let reopened = journal_at(dir.path());
    reopened.open().unwrap();
    assert_eq!(reopened.restore().unwrap(), kept);
    assert_eq!(
        reopened.load(kept[kept.len() - 1]).unwrap().payload.as_text(),
        Some("m499")
    );
}

#[test]
fn test_journal_truncates_torn_tail() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_at(dir.path());
    journal.open().unwrap();
    journal.restore().unwrap();
    let id = journal.store(&Holder::new("q", "survivor")).unwrap();
    journal.close().unwrap();

    let mut bytes = fs::read(dir.path().join(journal::JOURNAL_FILE)).unwrap();
    bytes.extend_from_slice(&[40, 0, 0, 0, 7, 7, 7]);
    fs::write(dir.path().join(journal::JOURNAL_FILE), bytes).unwrap();

    let reopened = journal_at(dir.path());
    reopened.open().unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![id]);
    let next = reopened.store(&Holder::new("q", "next")).unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![id, next]);
}

#[test]
fn test_log_rolls_and_deletes_old_segments() {
    let dir = tempfile::tempdir().unwrap();
    // tiny segments so every couple of frames start a new one
    let log = log_at(dir.path(), 64);
    log.open().unwrap();
    log.restore().unwrap();

    let first: Vec<ObjectId> = (0..6)
        .map(|i| log.store(&Holder::new("q", format!("old{i}"))).unwrap())
        .collect();
    for id in &first {
        log.remove(*id).unwrap();
    }
    let keep = log.store(&Holder::new("q", "keep")).unwrap();
    let segments_before = log.segment_count();
    assert!(segments_before > 2);

    log.compact().unwrap();
    assert_eq!(log.persisted_mark(), Some(12));
    assert!(log.segment_count() < segments_before);
    assert!(dir.path().join(log::MARK_FILE).exists());
    log.close().unwrap();

    let reopened = log_at(dir.path(), 64);
    reopened.open().unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![keep]);
    // lsns continue after the mark
    let next = reopened.store(&Holder::new("q", "next")).unwrap();
    assert_eq!(reopened.restore().unwrap(), vec![keep, next]);
}

#[test]
fn test_log_replay_without_compaction_sees_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_at(dir.path(), 4096);
    log.open().unwrap();
    log.restore().unwrap();
    let a = log.store(&Holder::new("orders", "item1")).unwrap();
    let b = log.store(&Holder::new("orders", "item2")).unwrap();
    log.remove(a).unwrap();
    log.close().unwrap();

    let mut seen = Vec::new();
    let segment = dir.path().join("log-00000001.seg");
    frame_file::read_records(&segment, |lsn, record| {
        seen.push((lsn, record.record_type(), record.id()));
        Ok(())
    })
    .unwrap();

    assert_eq!(
        seen,
        vec![
            (0, RecordType::StoreString, a),
            (1, RecordType::StoreString, b),
            (2, RecordType::Delete, a),
        ]
    );
}
