//! Static partitioning plus the override layer on top of it.

use std::collections::BTreeSet;

use crate::directory::LocationDirectory;
use crate::key::{KeyRange, PartitionId, RecordKey};
use crate::plan::MigrationUnit;

/// Static placement supplied by the execution layer.
pub trait PartitionFunction: Send + Sync + 'static {
    /// Home partition of `key` before any migration.
    fn partition(&self, key: &RecordKey) -> PartitionId;

    /// Fully replicated keys live on every node and are never monitored.
    fn is_fully_replicated(&self, _key: &RecordKey) -> bool {
        false
    }

    /// Key standing in for the group `key` belongs to. Grouping keys lets the
    /// access graph keep one vertex per group instead of one per record.
    fn representative(&self, key: &RecordKey) -> RecordKey {
        key.clone()
    }
}

/// Produces predefined ("cold") plans for node scaling.
pub trait ColdMigrationPlanner: Send + Sync + 'static {
    /// Plans that populate the newest partition `num_partitions - 1`.
    fn scale_out_plans(&self, num_partitions: usize) -> Vec<MigrationUnit>;

    /// Plans that drain `retiring` into the other `num_partitions - 1` partitions.
    fn consolidation_plans(&self, retiring: PartitionId, num_partitions: usize) -> Vec<MigrationUnit>;
}

/// Contiguous id ranges: partition `p` owns ids
/// `[p * keys_per_partition, (p + 1) * keys_per_partition)`; ids past the
/// last range stay on the last partition.
#[derive(Clone, Debug)]
pub struct RangePartitioner {
    num_partitions: usize,
    keys_per_partition: u64,
    replicated_tables: BTreeSet<String>,
}

impl RangePartitioner {
    pub fn new(num_partitions: usize, keys_per_partition: u64) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            keys_per_partition: keys_per_partition.max(1),
            replicated_tables: BTreeSet::new(),
        }
    }

    /// Mark every key of `table` as fully replicated.
    pub fn with_replicated_table(mut self, table: impl Into<String>) -> Self {
        self.replicated_tables.insert(table.into());
        self
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn keys_per_partition(&self) -> u64 {
        self.keys_per_partition
    }

    pub fn partition_range(&self, partition: PartitionId) -> KeyRange {
        let start = partition as u64 * self.keys_per_partition;
        KeyRange::new(start, start + self.keys_per_partition)
    }
}

impl PartitionFunction for RangePartitioner {
    fn partition(&self, key: &RecordKey) -> PartitionId {
        let idx = key.id / self.keys_per_partition;
        (idx as usize).min(self.num_partitions - 1)
    }

    fn is_fully_replicated(&self, key: &RecordKey) -> bool {
        self.replicated_tables.contains(&key.table)
    }
}

impl ColdMigrationPlanner for RangePartitioner {
    /// Every existing partition hands the top `1 / num_partitions` slice of
    /// its range to the new partition.
    fn scale_out_plans(&self, num_partitions: usize) -> Vec<MigrationUnit> {
        if num_partitions < 2 {
            return Vec::new();
        }
        let new_partition = num_partitions - 1;
        let slice = (self.keys_per_partition / num_partitions as u64).max(1);
        (0..new_partition)
            .map(|source| {
                let range = self.partition_range(source);
                let start = range.end.saturating_sub(slice).max(range.start);
                MigrationUnit::range(source, new_partition, KeyRange::new(start, range.end))
            })
            .collect()
    }

    /// The retiring range is cut into equal slices, one per remaining partition.
    fn consolidation_plans(&self, retiring: PartitionId, num_partitions: usize) -> Vec<MigrationUnit> {
        let receivers = (0..num_partitions)
            .filter(|p| *p != retiring)
            .collect::<Vec<_>>();
        if receivers.is_empty() {
            return Vec::new();
        }
        let range = self.partition_range(retiring);
        let slice = (self.keys_per_partition / receivers.len() as u64).max(1);
        let mut units = Vec::with_capacity(receivers.len());
        for (idx, dest) in receivers.iter().enumerate() {
            let start = range.start + slice * idx as u64;
            if start >= range.end {
                break;
            }
            let end = if idx + 1 == receivers.len() {
                range.end
            } else {
                (start + slice).min(range.end)
            };
            units.push(MigrationUnit::range(retiring, *dest, KeyRange::new(start, end)));
        }
        units
    }
}

/// Authoritative placement oracle: location overrides layered over a static
/// partition function.
#[derive(Debug)]
pub struct PartitionMap<P> {
    function: P,
    directory: LocationDirectory,
}

impl<P: PartitionFunction> PartitionMap<P> {
    pub fn new(function: P, directory_capacity: usize) -> Self {
        Self {
            function,
            directory: LocationDirectory::new(directory_capacity),
        }
    }

    pub fn function(&self) -> &P {
        &self.function
    }

    pub fn directory(&self) -> &LocationDirectory {
        &self.directory
    }

    pub fn static_partition(&self, key: &RecordKey) -> PartitionId {
        self.function.partition(key)
    }

    pub fn is_fully_replicated(&self, key: &RecordKey) -> bool {
        self.function.is_fully_replicated(key)
    }

    pub fn representative(&self, key: &RecordKey) -> RecordKey {
        self.function.representative(key)
    }

    pub fn current_location(&self, key: &RecordKey) -> PartitionId {
        self.directory
            .get_location(key)
            .unwrap_or_else(|| self.function.partition(key))
    }

    /// Whether `key` currently lives somewhere other than its home partition.
    pub fn is_relocated(&self, key: &RecordKey) -> bool {
        self.directory.contains_key(key)
    }

    /// Move `key` to `partition`. Returning home drops the override so the
    /// directory only holds keys that actually differ from the default.
    pub fn set_current_location(&mut self, key: &RecordKey, partition: PartitionId) {
        if self.function.partition(key) == partition {
            self.directory.remove(key);
        } else {
            self.directory.set_location(key, partition);
        }
    }
}
