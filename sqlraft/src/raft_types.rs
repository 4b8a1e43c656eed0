use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a log entry: the term in which it was created and its position in the log.
///
/// The first real index is 1; `LogId { term: 0, index: 0 }` denotes an empty log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// An identifier of a snapshot.
///
/// Two snapshots built with the same last log id may still differ in bytes, so snapshots carry a
/// distinct id for transfer bookkeeping.
pub type SnapshotId = String;

/// A small wrapper to distinguish "set this value" from "leave it alone" in update calls.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
