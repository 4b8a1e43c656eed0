//! Registry tests: stable indices, lowest-free-slot reuse and compaction on delete.

use pretty_assertions::assert_eq;
use sqlraft::server::registry::Registry;

#[test]
fn add_returns_stable_indices() {
    let mut r = Registry::new();
    assert_eq!(r.add("a"), 0);
    assert_eq!(r.add("b"), 1);
    assert_eq!(r.add("c"), 2);
    assert_eq!(r.get(1), Some(&"b"));
    assert_eq!(r.len(), 3);
}

#[test]
fn deleted_slots_are_reused_lowest_first() {
    let mut r = Registry::new();
    r.add("a");
    r.add("b");
    r.add("c");

    assert_eq!(r.del(1), Some("b"));
    assert_eq!(r.get(1), None);

    // The freed slot is handed out again before the arena grows.
    assert_eq!(r.add("d"), 1);
    assert_eq!(r.add("e"), 3);
}

#[test]
fn delete_compacts_trailing_slots() {
    let mut r = Registry::new();
    for i in 0..8 {
        r.add(i);
    }
    assert_eq!(r.slot_count(), 8);

    // Deleting the tail shrinks the slot array; deleting from the middle leaves a hole.
    r.del(7);
    assert_eq!(r.slot_count(), 7);
    r.del(3);
    assert_eq!(r.slot_count(), 7);

    // Deleting the new tail sweeps the trailing holes too.
    r.del(6);
    r.del(5);
    r.del(4);
    assert_eq!(r.slot_count(), 3);
    assert_eq!(r.len(), 3);
}

#[test]
fn footprint_halves_below_half_occupancy() {
    let mut r = Registry::new();
    for i in 0..64 {
        r.add(i);
    }
    let full = r.slot_count();
    assert_eq!(full, 64);

    // Drop the top three quarters; the arena sheds capacity instead of hoarding it.
    for i in (16..64).rev() {
        r.del(i);
    }
    assert_eq!(r.slot_count(), 16);
    assert!(r.len() == 16);

    let mut indices: Vec<usize> = r.iter().map(|(i, _)| i).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..16).collect::<Vec<_>>());
}

#[test]
fn unknown_indices_answer_none() {
    let mut r: Registry<u32> = Registry::new();
    assert_eq!(r.get(0), None);
    assert_eq!(r.del(5), None);
    r.add(1);
    assert_eq!(r.del(0), Some(1));
    assert_eq!(r.del(0), None);
}
