//! Migration plans: which keys move from which partition to which.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::key::{KeyRange, PartitionId, RecordKey};

/// Keys covered by one migration unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationScope {
    /// Explicit key list, as produced by Clay clumps.
    Keys(BTreeSet<RecordKey>),
    /// Every key whose id falls in the range, as used by cold scaling plans.
    Range(KeyRange),
}

/// One `(source, dest)` move executed by a single external migration
/// transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationUnit {
    pub source: PartitionId,
    pub dest: PartitionId,
    pub scope: MigrationScope,
}

impl MigrationUnit {
    pub fn keys(source: PartitionId, dest: PartitionId) -> Self {
        Self {
            source,
            dest,
            scope: MigrationScope::Keys(BTreeSet::new()),
        }
    }

    pub fn range(source: PartitionId, dest: PartitionId, range: KeyRange) -> Self {
        Self {
            source,
            dest,
            scope: MigrationScope::Range(range),
        }
    }

    /// Adds a key to a key-list unit. Range units already cover their keys.
    pub fn add_key(&mut self, key: RecordKey) {
        if let MigrationScope::Keys(keys) = &mut self.scope {
            keys.insert(key);
        }
    }

    /// Whether `key` is covered by this unit.
    pub fn covers(&self, key: &RecordKey) -> bool {
        match &self.scope {
            MigrationScope::Keys(keys) => keys.contains(key),
            MigrationScope::Range(range) => range.contains(key),
        }
    }

    /// Number of explicit keys (range units report the width of the range).
    pub fn key_count(&self) -> u64 {
        match &self.scope {
            MigrationScope::Keys(keys) => keys.len() as u64,
            MigrationScope::Range(range) => range.end.saturating_sub(range.start),
        }
    }

    pub fn to_request(&self) -> MigrationRequest {
        let payload = match &self.scope {
            MigrationScope::Keys(keys) => MigrationPayload::Keys(keys.iter().cloned().collect()),
            MigrationScope::Range(range) => MigrationPayload::Range(*range),
        };
        MigrationRequest {
            source: self.source,
            dest: self.dest,
            payload,
        }
    }

    fn absorb(&mut self, other: MigrationScope) {
        if let (MigrationScope::Keys(mine), MigrationScope::Keys(theirs)) = (&mut self.scope, other) {
            mine.extend(theirs);
        }
    }

    /// Key-list units on the same route merge; range units always stay apart.
    fn same_route(&self, other: &MigrationUnit) -> bool {
        self.source == other.source
            && self.dest == other.dest
            && matches!(
                (&self.scope, &other.scope),
                (MigrationScope::Keys(_), MigrationScope::Keys(_))
            )
    }
}

/// Payload of the tuple handed to the execution layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPayload {
    Keys(Vec<RecordKey>),
    Range(KeyRange),
}

/// Opaque request the execution layer turns into a migration transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source: PartitionId,
    pub dest: PartitionId,
    pub payload: MigrationPayload,
}

impl fmt::Display for MigrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            MigrationPayload::Keys(keys) => write!(
                f,
                "part.{} -> part.{} ({} keys)",
                self.source,
                self.dest,
                keys.len()
            ),
            MigrationPayload::Range(range) => write!(
                f,
                "part.{} -> part.{} (ids {}..{})",
                self.source, self.dest, range.start, range.end
            ),
        }
    }
}

/// Ordered list of migration units.
///
/// Merging is additive: a unit with an already-present `(source, dest)` pair
/// folds its keys into the existing one; new pairs keep emission order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    units: Vec<MigrationUnit>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&mut self, unit: MigrationUnit) {
        if unit.key_count() == 0 {
            return;
        }
        match self.units.iter_mut().find(|u| u.same_route(&unit)) {
            Some(existing) => existing.absorb(unit.scope),
            None => self.units.push(unit),
        }
    }

    pub fn merge(&mut self, other: MigrationPlan) {
        for unit in other.units {
            self.add_unit(unit);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<MigrationUnit> {
        self.units
    }

    pub fn count_keys(&self) -> u64 {
        self.units.iter().map(MigrationUnit::key_count).sum()
    }
}

impl FromIterator<MigrationUnit> for MigrationPlan {
    fn from_iter<I: IntoIterator<Item = MigrationUnit>>(iter: I) -> Self {
        let mut plan = MigrationPlan::new();
        for unit in iter {
            plan.add_unit(unit);
        }
        plan
    }
}
