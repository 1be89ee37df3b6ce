//! Bounded-memory index of partition-location overrides.
//!
//! Keys whose placement differs from the static partition function are
//! tracked here. Most lookups hit a fixed-capacity slot table (array plus a
//! free list). When every slot is taken, a victim is chosen round-robin and
//! demoted into an unbounded overflow map, so no override is ever lost; it
//! only becomes a slower lookup.
//!
//! Single-threaded by contract: only the scheduler thread mutates it.

use std::collections::{BTreeMap, HashMap};

use crate::key::{PartitionId, RecordKey};

/// Default number of slots in the primary tier.
pub const DEFAULT_DIRECTORY_CAPACITY: usize = 100_000;

#[derive(Debug, Clone)]
struct LocationSlot {
    /// `None` when the slot is on the free list.
    key: Option<RecordKey>,
    partition: PartitionId,
    next_free: Option<usize>,
}

/// Two-tier key → partition override table.
#[derive(Debug)]
pub struct LocationDirectory {
    slots: Vec<LocationSlot>,
    first_free: Option<usize>,
    key_to_slot: HashMap<RecordKey, usize>,
    overflow: HashMap<RecordKey, PartitionId>,
    last_evicted: Option<usize>,
    counts_per_partition: BTreeMap<PartitionId, usize>,
}

impl Default for LocationDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTORY_CAPACITY)
    }
}

impl LocationDirectory {
    /// Create a directory whose primary tier holds `capacity` keys.
    ///
    /// The total size may exceed `capacity`; the excess lives in overflow.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|idx| LocationSlot {
                key: None,
                partition: 0,
                next_free: (idx + 1 < capacity).then_some(idx + 1),
            })
            .collect::<Vec<_>>();
        Self {
            slots,
            first_free: Some(0),
            key_to_slot: HashMap::with_capacity(capacity),
            overflow: HashMap::new(),
            last_evicted: None,
            counts_per_partition: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Record that `key` now lives on `partition`.
    pub fn set_location(&mut self, key: &RecordKey, partition: PartitionId) {
        if let Some(&slot_id) = self.key_to_slot.get(key) {
            let previous = self.slots[slot_id].partition;
            self.decrement_count(previous);
            self.slots[slot_id].partition = partition;
        } else if let Some(entry) = self.overflow.get_mut(key) {
            let previous = *entry;
            *entry = partition;
            self.decrement_count(previous);
        } else {
            self.insert_new(key.clone(), partition);
        }
        *self.counts_per_partition.entry(partition).or_insert(0) += 1;
    }

    /// Returns the override for `key`, or `None` to defer to the static
    /// partition function.
    pub fn get_location(&self, key: &RecordKey) -> Option<PartitionId> {
        match self.key_to_slot.get(key) {
            Some(&slot_id) => Some(self.slots[slot_id].partition),
            None => self.overflow.get(key).copied(),
        }
    }

    pub fn contains_key(&self, key: &RecordKey) -> bool {
        self.key_to_slot.contains_key(key) || self.overflow.contains_key(key)
    }

    /// Drop the override for `key`, returning the partition it recorded.
    pub fn remove(&mut self, key: &RecordKey) -> Option<PartitionId> {
        if let Some(slot_id) = self.key_to_slot.remove(key) {
            let partition = self.slots[slot_id].partition;
            let slot = &mut self.slots[slot_id];
            slot.key = None;
            slot.next_free = self.first_free;
            self.first_free = Some(slot_id);
            self.decrement_count(partition);
            return Some(partition);
        }
        let partition = self.overflow.remove(key)?;
        self.decrement_count(partition);
        Some(partition)
    }

    /// Number of tracked keys across both tiers.
    pub fn len(&self) -> usize {
        self.key_to_slot.len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Keys currently demoted to the overflow tier, sorted.
    pub fn overflow_keys(&self) -> Vec<RecordKey> {
        let mut keys = self.overflow.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Number of overridden keys recorded on `partition`.
    pub fn count_on(&self, partition: PartitionId) -> usize {
        self.counts_per_partition
            .get(&partition)
            .copied()
            .unwrap_or(0)
    }

    fn insert_new(&mut self, key: RecordKey, partition: PartitionId) {
        let slot_id = match self.pop_free_slot() {
            Some(slot_id) => slot_id,
            None => self.evict_slot(),
        };
        let slot = &mut self.slots[slot_id];
        slot.key = Some(key.clone());
        slot.partition = partition;
        slot.next_free = None;
        self.key_to_slot.insert(key, slot_id);
    }

    fn pop_free_slot(&mut self) -> Option<usize> {
        let slot_id = self.first_free?;
        self.first_free = self.slots[slot_id].next_free.take();
        Some(slot_id)
    }

    /// Demote the next round-robin victim into overflow and hand back its slot.
    ///
    /// Only called with an empty free list, so every slot is occupied.
    fn evict_slot(&mut self) -> usize {
        let slot_id = self
            .last_evicted
            .map(|last| (last + 1) % self.slots.len())
            .unwrap_or(0);
        self.last_evicted = Some(slot_id);

        let slot = &mut self.slots[slot_id];
        if let Some(victim) = slot.key.take() {
            self.key_to_slot.remove(&victim);
            tracing::trace!(key = %victim, slot_id, "location directory slot evicted to overflow");
            self.overflow.insert(victim, slot.partition);
        }
        slot_id
    }

    fn decrement_count(&mut self, partition: PartitionId) {
        if let Some(count) = self.counts_per_partition.get_mut(&partition) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts_per_partition.remove(&partition);
            }
        }
    }
}
