//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use holo_rebalance::{
    MigrationExecutor, MigrationRequest, PartitionFunction, PartitionId, PartitionMap, PushTransport,
    RangePartitioner, RecordKey,
};

pub const TABLE: &str = "usertable";

pub fn key(id: u64) -> RecordKey {
    RecordKey::new(TABLE, id)
}

pub fn keys(ids: &[u64]) -> Vec<RecordKey> {
    ids.iter().map(|id| key(*id)).collect()
}

/// Collects every request handed to the execution layer.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    submitted: Arc<Mutex<Vec<MigrationRequest>>>,
}

impl RecordingExecutor {
    pub fn submitted(&self) -> Vec<MigrationRequest> {
        self.submitted.lock().expect("submitted lock").clone()
    }
}

impl MigrationExecutor for RecordingExecutor {
    fn submit(&mut self, request: MigrationRequest) -> anyhow::Result<()> {
        self.submitted.lock().expect("submitted lock").push(request);
        Ok(())
    }
}

/// Background push transport that remembers every batch.
#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<(PartitionId, PartitionId, Vec<RecordKey>)>>,
}

impl RecordingTransport {
    pub fn batches(&self) -> Vec<(PartitionId, PartitionId, Vec<RecordKey>)> {
        self.batches.lock().expect("batches lock").clone()
    }

    pub fn pushed_keys(&self) -> Vec<RecordKey> {
        let mut keys = self
            .batches()
            .into_iter()
            .flat_map(|(_, _, keys)| keys)
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    fn record_size(&self, _table: &str) -> usize {
        100
    }

    async fn push(&self, source: PartitionId, dest: PartitionId, keys: Vec<RecordKey>) -> anyhow::Result<()> {
        self.batches
            .lock()
            .expect("batches lock")
            .push((source, dest, keys));
        Ok(())
    }
}

/// Range partitioning where every block of ten ids shares one
/// representative, so the access graph keeps a vertex per block.
#[derive(Clone, Debug)]
pub struct BlockPartitioner {
    inner: RangePartitioner,
}

impl BlockPartitioner {
    pub fn new(num_partitions: usize, keys_per_partition: u64) -> Self {
        Self {
            inner: RangePartitioner::new(num_partitions, keys_per_partition),
        }
    }
}

impl PartitionFunction for BlockPartitioner {
    fn partition(&self, key: &RecordKey) -> PartitionId {
        self.inner.partition(key)
    }

    fn representative(&self, key: &RecordKey) -> RecordKey {
        RecordKey::new(key.table.clone(), key.id / 10 * 10)
    }
}

pub fn range_map(num_partitions: usize, keys_per_partition: u64) -> PartitionMap<RangePartitioner> {
    PartitionMap::new(RangePartitioner::new(num_partitions, keys_per_partition), 1024)
}
