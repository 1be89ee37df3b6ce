//! Clay: clump-based migration planning over the weighted access graph.
//!
//! Each pass recomputes partition loads, picks the lowest-id partition above
//! the overload threshold, grows a clump from its hottest vertex and emits a
//! migration unit per source partition. Moved vertices are reassigned in the
//! graph before the next pass, so later clumps see the speculative placement.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::clump::Clump;
use crate::error::InvariantViolation;
use crate::graph::{PartitionLoad, VertexId, WeightedAccessGraph};
use crate::key::{PartitionId, RecordKey};
use crate::partition::{PartitionFunction, PartitionMap};
use crate::plan::MigrationPlan;

/// Tuning knobs for the Clay planner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClayConfig {
    /// Weight applied to co-access edges that cross partitions.
    pub multi_parts_cost: f64,
    /// A partition is overloaded above `mean_load * overload_percentage`.
    pub overload_percentage: f64,
    /// Consecutive infeasible expansions tolerated after a feasible
    /// candidate was seen.
    pub look_ahead_max: usize,
    pub clump_max_size: usize,
    /// Upper bound on clumps emitted by one planning pass.
    pub max_clumps: usize,
}

impl Default for ClayConfig {
    fn default() -> Self {
        Self {
            multi_parts_cost: 1.0,
            overload_percentage: 1.3,
            look_ahead_max: 5,
            clump_max_size: 20,
            max_clumps: 5000,
        }
    }
}

#[derive(Debug)]
pub struct ClayPlanner {
    cfg: ClayConfig,
    graph: WeightedAccessGraph,
    /// Partitions drained by consolidation; never planned over again.
    retired: BTreeSet<PartitionId>,
}

impl ClayPlanner {
    pub fn new(cfg: ClayConfig) -> Self {
        Self {
            cfg,
            graph: WeightedAccessGraph::new(),
            retired: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> ClayConfig {
        self.cfg
    }

    pub fn graph(&self) -> &WeightedAccessGraph {
        &self.graph
    }

    /// Feed one transaction's combined read/write set into the graph.
    ///
    /// Keys are folded onto their group representative and recorded at their
    /// current location. A fully replicated key is a caller bug and fails
    /// with [`InvariantViolation::FullyReplicatedKey`] before the graph is
    /// touched.
    pub fn monitor_transaction<P: PartitionFunction>(
        &mut self,
        keys: &[RecordKey],
        partitions: &PartitionMap<P>,
    ) -> anyhow::Result<()> {
        let mut accessed = BTreeSet::new();
        for key in keys {
            if partitions.is_fully_replicated(key) {
                return Err(InvariantViolation::FullyReplicatedKey(key.clone()).into());
            }
            accessed.insert(partitions.representative(key));
        }
        let accessed = accessed.into_iter().collect::<Vec<_>>();
        for key in &accessed {
            self.graph
                .record_vertex_access(key, partitions.current_location(key));
        }
        self.graph.record_co_access(&accessed)
    }

    /// Take `partition` out of every later planning pass: it is neither
    /// measured nor chosen as a destination. Survives [`reset`](Self::reset).
    pub fn retire_partition(&mut self, partition: PartitionId) {
        self.retired.insert(partition);
    }

    pub fn is_retired(&self, partition: PartitionId) -> bool {
        self.retired.contains(&partition)
    }

    /// Number of retired partitions below `num_partitions`.
    pub fn retired_count(&self, num_partitions: usize) -> usize {
        self.retired.range(..num_partitions).count()
    }

    /// Run clump generation until no partition is overloaded.
    ///
    /// Plans over `0..num_partitions` minus retired partitions. Returns
    /// `None` when nothing needs to move. Vertex placement in the graph is
    /// updated as clumps are emitted, so call [`reset`](Self::reset) before
    /// planning again from fresh observations.
    pub fn generate_plan(&mut self, num_partitions: usize) -> anyhow::Result<Option<MigrationPlan>> {
        let started = Instant::now();
        let mut plan = MigrationPlan::new();
        let mut clumps = 0usize;

        loop {
            let loads = self.live_loads(num_partitions);
            if loads.is_empty() {
                break;
            }
            let threshold = overload_threshold(&loads, self.cfg.overload_percentage);
            tracing::debug!(?loads, threshold, "clay partition loads");

            let Some(overloaded) = loads.iter().find(|load| load.total_load() > threshold) else {
                break;
            };
            let Some(clump) = self.generate_clump(overloaded.partition, &loads, threshold)? else {
                break;
            };
            // Nothing left that could relieve this partition.
            if !clump.needs_migration(&self.graph) {
                break;
            }

            tracing::debug!(
                clump = clumps,
                size = clump.size(),
                source = overloaded.partition,
                dest = clump.destination(),
                "clay clump generated"
            );
            clumps += 1;
            plan.merge(clump.to_migration_plan(&self.graph));
            self.apply_clump(&clump);

            if clumps >= self.cfg.max_clumps {
                tracing::warn!(max_clumps = self.cfg.max_clumps, "clay reached clump limit");
                break;
            }
        }

        if plan.is_empty() {
            return Ok(None);
        }
        tracing::info!(
            clumps,
            keys = plan.count_keys(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "clay generated migration plan"
        );
        Ok(Some(plan))
    }

    /// Least-loaded live partition by total load; ties go to the lowest id.
    pub fn find_least_load_partition(&self, num_partitions: usize) -> Option<PartitionId> {
        least_loaded(&self.live_loads(num_partitions), None)
    }

    /// Discard every observation. Retired partitions stay retired.
    pub fn reset(&mut self) {
        self.graph = WeightedAccessGraph::new();
    }

    /// Load views of the partitions still in service, in id order.
    fn live_loads(&self, num_partitions: usize) -> Vec<PartitionLoad> {
        let mut loads = self
            .graph
            .snapshot_partitions(num_partitions, self.cfg.multi_parts_cost);
        loads.retain(|load| !self.retired.contains(&load.partition));
        loads
    }

    /// `loads` holds live partitions only.
    pub(crate) fn generate_clump(
        &self,
        overloaded: PartitionId,
        loads: &[PartitionLoad],
        threshold: f64,
    ) -> anyhow::Result<Option<Clump>> {
        let Some(seed) = self.graph.hottest_vertex(overloaded) else {
            return Ok(None);
        };
        let Some(mut dest) = self.initial_destination(seed, overloaded, loads) else {
            return Ok(None);
        };
        let mut clump = Clump::new(&self.graph, seed, dest);
        let mut candidate: Option<Clump> = None;
        let mut look_ahead = self.cfg.look_ahead_max;

        loop {
            if self.is_feasible(&clump, dest, loads, threshold) {
                candidate = Some(clump.clone());
                look_ahead = self.cfg.look_ahead_max;
            } else if candidate.is_some() {
                look_ahead = look_ahead.saturating_sub(1);
            }

            if clump.size() > self.cfg.clump_max_size {
                return Ok(Some(candidate.unwrap_or(clump)));
            }
            if look_ahead == 0 {
                return Ok(candidate);
            }

            let Some(next) = clump.hottest_neighbor(&self.graph) else {
                return Ok(candidate);
            };
            clump.expand(&self.graph, next)?;
            dest = self.update_destination(&clump, dest, overloaded, loads, threshold);
            clump.set_destination(dest);
        }
    }

    /// Live partition reached by most of the seed's edges, else the
    /// least-loaded live partition other than the overloaded one.
    fn initial_destination(
        &self,
        seed: VertexId,
        overloaded: PartitionId,
        loads: &[PartitionLoad],
    ) -> Option<PartitionId> {
        let edges = &self.graph.vertex(seed).edges;
        let mut best: Option<(PartitionId, usize)> = None;
        for load in loads {
            if load.partition == overloaded {
                continue;
            }
            let count = edges
                .keys()
                .filter(|&&neighbor| self.graph.vertex(neighbor).partition == load.partition)
                .count();
            if count > 0 && best.map_or(true, |(_, most)| count > most) {
                best = Some((load.partition, count));
            }
        }
        best.map(|(partition, _)| partition)
            .or_else(|| least_loaded(loads, Some(overloaded)))
    }

    fn update_destination(
        &self,
        clump: &Clump,
        current: PartitionId,
        overloaded: PartitionId,
        loads: &[PartitionLoad],
        threshold: f64,
    ) -> PartitionId {
        if self.is_feasible(clump, current, loads, threshold) {
            return current;
        }

        let mut excluded = vec![overloaded];
        excluded.extend(self.retired.iter().copied());
        let bound = loads.last().map_or(0, |load| load.partition + 1);
        if let Some(most) = clump.most_coaccessed_partition(&self.graph, bound, &excluded) {
            if most != current && self.is_feasible(clump, most, loads, threshold) {
                return most;
            }
        }

        if let Some(least) = least_loaded(loads, Some(overloaded)) {
            let cost = self.cfg.multi_parts_cost;
            if least != current
                && clump.recv_load_delta(&self.graph, least, cost)
                    < clump.recv_load_delta(&self.graph, current, cost)
                && self.is_feasible(clump, least, loads, threshold)
            {
                return least;
            }
        }

        // Keep it; later growth may make the clump feasible again.
        current
    }

    fn is_feasible(&self, clump: &Clump, dest: PartitionId, loads: &[PartitionLoad], threshold: f64) -> bool {
        let Some(load) = loads.iter().find(|load| load.partition == dest) else {
            return false;
        };
        let delta = clump.recv_load_delta(&self.graph, dest, self.cfg.multi_parts_cost);
        delta <= 0.0 || load.total_load() + delta < threshold
    }

    fn apply_clump(&mut self, clump: &Clump) {
        let dest = clump.destination();
        for id in clump.vertices() {
            self.graph.set_partition(id, dest);
            self.graph.mark_moved(id);
        }
    }
}

fn overload_threshold(loads: &[PartitionLoad], overload_percentage: f64) -> f64 {
    let total: f64 = loads.iter().map(PartitionLoad::total_load).sum();
    total / loads.len() as f64 * overload_percentage
}

fn least_loaded(loads: &[PartitionLoad], excluding: Option<PartitionId>) -> Option<PartitionId> {
    let mut best: Option<&PartitionLoad> = None;
    for load in loads {
        if excluding == Some(load.partition) {
            continue;
        }
        if best.map_or(true, |b| load.total_load() < b.total_load()) {
            best = Some(load);
        }
    }
    best.map(|load| load.partition)
}
