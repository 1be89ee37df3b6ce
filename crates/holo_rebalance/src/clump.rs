//! A clump is the candidate migration unit grown by the Clay planner.
//!
//! It holds vertex ids only; every weight and partition lookup goes through
//! the graph, so cloning a clump is a plain value snapshot of its membership
//! and frontier.

use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{VertexId, WeightedAccessGraph};
use crate::key::PartitionId;
use crate::plan::{MigrationPlan, MigrationUnit};

#[derive(Clone, Debug)]
pub struct Clump {
    vertices: BTreeSet<VertexId>,
    /// Adjacent vertices not in the clump → cumulative connecting weight.
    frontier: BTreeMap<VertexId, f64>,
    dest: PartitionId,
}

impl Clump {
    pub fn new(graph: &WeightedAccessGraph, seed: VertexId, dest: PartitionId) -> Self {
        let mut clump = Self {
            vertices: BTreeSet::new(),
            frontier: BTreeMap::new(),
            dest,
        };
        clump.add_vertex(graph, seed);
        clump
    }

    /// Pull `vertex` from the frontier into the clump.
    pub fn expand(&mut self, graph: &WeightedAccessGraph, vertex: VertexId) -> anyhow::Result<()> {
        if self.frontier.remove(&vertex).is_none() {
            anyhow::bail!(
                "vertex {} ({}) is not on the clump frontier",
                vertex,
                graph.vertex(vertex).key
            );
        }
        self.add_vertex(graph, vertex);
        Ok(())
    }

    /// Frontier vertex with the highest connecting weight; ties go to the
    /// lowest key.
    pub fn hottest_neighbor(&self, graph: &WeightedAccessGraph) -> Option<VertexId> {
        let mut best: Option<(VertexId, f64)> = None;
        for (&id, &weight) in &self.frontier {
            best = match best {
                Some((current, current_weight))
                    if weight < current_weight
                        || (weight == current_weight
                            && graph.vertex(current).key < graph.vertex(id).key) =>
                {
                    Some((current, current_weight))
                }
                _ => Some((id, weight)),
            };
        }
        best.map(|(id, _)| id)
    }

    pub fn has_neighbor(&self) -> bool {
        !self.frontier.is_empty()
    }

    pub fn size(&self) -> usize {
        self.vertices.len()
    }

    pub fn contains(&self, vertex: VertexId) -> bool {
        self.vertices.contains(&vertex)
    }

    pub fn vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices.iter().copied()
    }

    pub fn frontier(&self) -> impl Iterator<Item = (VertexId, f64)> + '_ {
        self.frontier.iter().map(|(&id, &weight)| (id, weight))
    }

    pub fn destination(&self) -> PartitionId {
        self.dest
    }

    pub fn set_destination(&mut self, dest: PartitionId) {
        self.dest = dest;
    }

    /// Load partition `dest` would gain by receiving the clump.
    ///
    /// Moved vertices bring their own weight. Each of their edges then
    /// changes `dest`'s boundary: an edge to a vertex already on `dest` stops
    /// crossing (`-w`), an edge to a vertex outside both the clump and `dest`
    /// starts crossing (`+w`), and an edge to another moving vertex stays
    /// internal.
    pub fn recv_load_delta(&self, graph: &WeightedAccessGraph, dest: PartitionId, cross_cost: f64) -> f64 {
        let mut moved_weight = 0.0;
        let mut edge_delta = 0.0;
        for &id in &self.vertices {
            let vertex = graph.vertex(id);
            if vertex.partition == dest {
                continue;
            }
            moved_weight += vertex.weight;
            for (&neighbor, &weight) in &vertex.edges {
                if graph.vertex(neighbor).partition == dest {
                    edge_delta -= weight;
                } else if !self.vertices.contains(&neighbor) {
                    edge_delta += weight;
                }
            }
        }
        moved_weight + cross_cost * edge_delta
    }

    /// Partition most co-accessed through the clump's boundary edges, by
    /// summed weight; ties go to the lowest partition id. Partitions in
    /// `excluding` are never returned.
    pub fn most_coaccessed_partition(
        &self,
        graph: &WeightedAccessGraph,
        num_partitions: usize,
        excluding: &[PartitionId],
    ) -> Option<PartitionId> {
        let mut coaccess = vec![0.0f64; num_partitions];
        for &id in &self.vertices {
            for (&neighbor, &weight) in &graph.vertex(id).edges {
                if self.vertices.contains(&neighbor) {
                    continue;
                }
                if let Some(slot) = coaccess.get_mut(graph.vertex(neighbor).partition) {
                    *slot += weight;
                }
            }
        }
        let mut best: Option<PartitionId> = None;
        for (partition, &weight) in coaccess.iter().enumerate() {
            if weight <= 0.0 || excluding.contains(&partition) {
                continue;
            }
            if best.map_or(true, |b| weight > coaccess[b]) {
                best = Some(partition);
            }
        }
        best
    }

    /// Whether any member is not already on the destination.
    pub fn needs_migration(&self, graph: &WeightedAccessGraph) -> bool {
        self.vertices
            .iter()
            .any(|&id| graph.vertex(id).partition != self.dest)
    }

    /// One key-list unit per source partition, all toward the destination.
    pub fn to_migration_plan(&self, graph: &WeightedAccessGraph) -> MigrationPlan {
        let mut by_source: BTreeMap<PartitionId, MigrationUnit> = BTreeMap::new();
        for &id in &self.vertices {
            let vertex = graph.vertex(id);
            if vertex.partition == self.dest {
                continue;
            }
            by_source
                .entry(vertex.partition)
                .or_insert_with(|| MigrationUnit::keys(vertex.partition, self.dest))
                .add_key(vertex.key.clone());
        }
        by_source.into_values().collect()
    }

    fn add_vertex(&mut self, graph: &WeightedAccessGraph, id: VertexId) {
        self.vertices.insert(id);
        self.frontier.remove(&id);
        for (&neighbor, &weight) in &graph.vertex(id).edges {
            if self.vertices.contains(&neighbor) {
                continue;
            }
            *self.frontier.entry(neighbor).or_insert(0.0) += weight;
        }
    }
}
