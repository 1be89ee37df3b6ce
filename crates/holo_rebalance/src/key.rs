//! Record identity shared by the graph, the directory, and migration plans.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical partition (data node) identifier.
pub type PartitionId = usize;

/// Identifies one data item: table name plus integer primary key.
///
/// Ordering is `(table, id)`. Every "lowest key" tie-break in planning and
/// background-push selection relies on it, so results are reproducible.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub id: u64,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, id: u64) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.id)
    }
}

/// End-exclusive range of key ids, used by range-scoped migrations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        key.id >= self.start && key.id < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}
