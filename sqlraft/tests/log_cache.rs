//! Log cache tests: lifecycle transitions, conflict truncation, snapshot trimming and
//! batch-aliased payloads.

use std::sync::Arc;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use sqlraft::log::EntryState;
use sqlraft::log::LogCache;
use sqlraft::raft::Entry;
use sqlraft::raft::EntryNormal;
use sqlraft::raft::EntryPayload;
use sqlraft::LogId;

fn entry(term: u64, index: u64, payload: Bytes) -> Arc<Entry<Bytes>> {
    Arc::new(Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal { data: payload }),
    })
}

fn payload_of(entry: &Entry<Bytes>) -> &Bytes {
    match &entry.payload {
        EntryPayload::Normal(normal) => &normal.data,
        _ => panic!("expected a normal entry"),
    }
}

#[test]
fn append_and_lookup() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    assert!(log.is_empty());

    for i in 1..=5 {
        log.append(entry(1, i, Bytes::from_static(b"x")));
    }
    assert_eq!(log.len(), 5);
    assert_eq!(log.first_index(), Some(1));
    assert_eq!(log.last_log_id(), LogId::new(1, 5));
    assert_eq!(log.term_of(0), Some(0));
    assert_eq!(log.term_of(3), Some(1));
    assert_eq!(log.term_of(6), None);
    assert_eq!(log.get(2).unwrap().log_id, LogId::new(1, 2));
    assert_eq!(log.state_of(2), Some(EntryState::Created));
}

#[test]
fn lifecycle_transitions() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 1..=3 {
        log.append(entry(1, i, Bytes::from_static(b"x")));
    }

    log.mark_committed(2);
    assert_eq!(log.state_of(1), Some(EntryState::Committed));
    assert_eq!(log.state_of(2), Some(EntryState::Committed));
    assert_eq!(log.state_of(3), Some(EntryState::Created));

    log.mark_applied(1);
    assert_eq!(log.state_of(1), Some(EntryState::Applied));

    // Marking applied is idempotent with respect to the committed step.
    log.mark_applied(3);
    assert_eq!(log.state_of(3), Some(EntryState::Applied));
}

#[test]
fn truncate_uncommitted_suffix() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 1..=5 {
        log.append(entry(1, i, Bytes::from_static(b"x")));
    }
    log.mark_committed(2);

    log.truncate(4).unwrap();
    assert_eq!(log.last_log_id(), LogId::new(1, 3));
    assert_eq!(log.len(), 3);

    // The removed indices are gone; appending at the truncation point succeeds with a new
    // term.
    log.append(entry(2, 4, Bytes::from_static(b"y")));
    assert_eq!(log.term_of(4), Some(2));
}

#[test]
fn truncating_a_committed_entry_fails() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 1..=3 {
        log.append(entry(1, i, Bytes::from_static(b"x")));
    }
    log.mark_committed(3);

    let err = log.truncate(2).unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("log inconsistency"), "unexpected error: {}", rendered);
}

#[test]
fn snapshot_trims_to_the_trailing_window() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 1..=10 {
        log.append(entry(1, i, Bytes::from_static(b"x")));
    }
    log.mark_committed(10);
    for i in 1..=10 {
        log.mark_applied(i);
    }

    // Snapshot through index 8, retaining 3 trailing entries: 1..=5 are compacted away.
    log.snapshot_taken(LogId::new(1, 8), 3);
    assert_eq!(log.first_index(), Some(6));
    assert_eq!(log.last_log_id(), LogId::new(1, 10));
    assert_eq!(log.term_of(8), Some(1));
    // The snapshot position still answers term lookups even when compacted.
    log.snapshot_taken(LogId::new(1, 10), 0);
    assert_eq!(log.first_index(), None);
    assert_eq!(log.term_of(10), Some(1));
}

#[test]
fn restore_replaces_everything() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 1..=4 {
        log.append(entry(1, i, Bytes::from_static(b"x")));
    }

    log.restore(LogId::new(3, 20));
    assert!(log.is_empty());
    assert_eq!(log.last_log_id(), LogId::new(3, 20));
    assert_eq!(log.snapshot_id(), LogId::new(3, 20));
    assert_eq!(log.term_of(20), Some(3));

    log.append(entry(3, 21, Bytes::from_static(b"y")));
    assert_eq!(log.last_log_id(), LogId::new(3, 21));
}

#[test]
fn batch_aliased_payloads_share_their_backing_allocation() {
    // Entries received in one batch carry slices of a single allocation.
    let batch = Bytes::from(vec![7u8; 64]);
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 0..4u64 {
        let at = (i as usize) * 16;
        log.append(entry(1, i + 1, batch.slice(at..at + 16)));
    }

    // The slices point into the batch allocation rather than copies of it.
    let first = log.get(1).unwrap();
    let slice_ptr = payload_of(&first).as_ptr();
    let batch_range = batch.as_ptr() as usize..batch.as_ptr() as usize + batch.len();
    assert!(batch_range.contains(&(slice_ptr as usize)));
}

#[test]
fn acquired_views_outlive_compaction() {
    let mut log: LogCache<Bytes> = LogCache::new(LogId::default(), LogId::default());
    for i in 1..=6 {
        log.append(entry(1, i, Bytes::from(vec![i as u8; 8])));
    }
    log.mark_committed(6);
    for i in 1..=6 {
        log.mark_applied(i);
    }

    let views = log.acquire(2, 3);
    assert_eq!(views.len(), 3);
    assert_eq!(views[0].log_id.index, 2);

    // Compact everything away; the views keep their entries alive and intact.
    log.snapshot_taken(LogId::new(1, 6), 0);
    assert!(log.is_empty());
    for (i, view) in views.iter().enumerate() {
        let index = (i + 2) as u8;
        assert_eq!(payload_of(view)[0], index);
        assert_eq!(Arc::strong_count(view), 1, "the cache released its reference");
    }
}
