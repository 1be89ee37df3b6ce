//! Weighted access graph built from live transaction access sets.
//!
//! Vertices live in an arena indexed by `VertexId`; edges store neighbour ids
//! rather than references, so reassigning a vertex's partition is a single
//! field write. Edges are kept symmetric: both endpoints carry the same
//! co-access weight.
//!
//! Mutated only by the scheduler thread; there is no internal locking.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::key::{PartitionId, RecordKey};

/// Index of a vertex in the graph arena.
pub type VertexId = usize;

/// One graph node: a record (or group representative) with its access weight.
#[derive(Clone, Debug, Serialize)]
pub struct Vertex {
    pub key: RecordKey,
    /// Number of transactions that accessed this key.
    pub weight: f64,
    /// Neighbour id → number of transactions that accessed both keys.
    pub edges: BTreeMap<VertexId, f64>,
    /// Current (possibly speculative) partition.
    pub partition: PartitionId,
    pub moved: bool,
}

impl Vertex {
    pub fn edge_weight(&self) -> f64 {
        self.edges.values().sum()
    }
}

/// Load seen by one partition at snapshot time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PartitionLoad {
    pub partition: PartitionId,
    /// Sum of resident vertices' own weight.
    pub local_load: f64,
    /// Edge weight leaving the partition, scaled by the cross-partition cost.
    pub cross_load: f64,
}

impl PartitionLoad {
    pub fn total_load(&self) -> f64 {
        self.local_load + self.cross_load
    }
}

#[derive(Debug, Default)]
pub struct WeightedAccessGraph {
    vertices: Vec<Vertex>,
    ids: HashMap<RecordKey, VertexId>,
}

impl WeightedAccessGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id]
    }

    pub fn vertex_id(&self, key: &RecordKey) -> Option<VertexId> {
        self.ids.get(key).copied()
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.vertices.iter().enumerate()
    }

    /// Count one access to `key`, creating its vertex on `observed_partition`
    /// the first time it is seen.
    pub fn record_vertex_access(&mut self, key: &RecordKey, observed_partition: PartitionId) -> VertexId {
        let id = match self.ids.get(key) {
            Some(&id) => id,
            None => {
                let id = self.vertices.len();
                self.vertices.push(Vertex {
                    key: key.clone(),
                    weight: 0.0,
                    edges: BTreeMap::new(),
                    partition: observed_partition,
                    moved: false,
                });
                self.ids.insert(key.clone(), id);
                id
            }
        };
        self.vertices[id].weight += 1.0;
        id
    }

    /// Count one co-access for every unordered pair of distinct keys.
    ///
    /// Every key must already have a vertex.
    pub fn record_co_access(&mut self, keys: &[RecordKey]) -> anyhow::Result<()> {
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(id) = self.vertex_id(key) else {
                anyhow::bail!("co-access recorded for unmonitored key {key}");
            };
            ids.push(id);
        }
        ids.sort_unstable();
        ids.dedup();

        for (idx, &a) in ids.iter().enumerate() {
            for &b in &ids[idx + 1..] {
                *self.vertices[a].edges.entry(b).or_insert(0.0) += 1.0;
                *self.vertices[b].edges.entry(a).or_insert(0.0) += 1.0;
            }
        }
        Ok(())
    }

    /// Fresh per-partition load views. Vertices placed outside
    /// `0..num_partitions` are ignored.
    pub fn snapshot_partitions(&self, num_partitions: usize, cross_cost: f64) -> Vec<PartitionLoad> {
        let mut loads = (0..num_partitions)
            .map(|partition| PartitionLoad {
                partition,
                local_load: 0.0,
                cross_load: 0.0,
            })
            .collect::<Vec<_>>();

        for vertex in &self.vertices {
            let Some(load) = loads.get_mut(vertex.partition) else {
                continue;
            };
            load.local_load += vertex.weight;
            for (&neighbor, &weight) in &vertex.edges {
                if self.vertices[neighbor].partition != vertex.partition {
                    load.cross_load += weight * cross_cost;
                }
            }
        }
        loads
    }

    /// Highest-weight vertex resident on `partition`; ties go to the lowest key.
    pub fn hottest_vertex(&self, partition: PartitionId) -> Option<VertexId> {
        let mut best: Option<VertexId> = None;
        for (id, vertex) in self.vertices() {
            if vertex.partition != partition {
                continue;
            }
            best = match best {
                Some(current) if !hotter(vertex, &self.vertices[current]) => Some(current),
                _ => Some(id),
            };
        }
        best
    }

    pub fn set_partition(&mut self, id: VertexId, partition: PartitionId) {
        self.vertices[id].partition = partition;
    }

    pub fn mark_moved(&mut self, id: VertexId) {
        self.vertices[id].moved = true;
    }

    /// Write the graph as JSON for offline analysis.
    pub fn write_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir {}", parent.display()))?;
        }
        let snapshot = GraphSnapshot {
            vertices: self
                .vertices
                .iter()
                .map(|v| SnapshotVertex {
                    key: &v.key,
                    weight: v.weight,
                    partition: v.partition,
                    edges: v
                        .edges
                        .iter()
                        .map(|(&id, &weight)| (&self.vertices[id].key, weight))
                        .collect(),
                })
                .collect(),
        };
        let payload = serde_json::to_vec(&snapshot).context("encode graph snapshot")?;
        fs::write(path, payload)
            .with_context(|| format!("write graph snapshot {}", path.display()))?;
        Ok(())
    }
}

/// Strictly hotter, or equally hot with a lower key.
fn hotter(a: &Vertex, b: &Vertex) -> bool {
    a.weight > b.weight || (a.weight == b.weight && a.key < b.key)
}

#[derive(Serialize)]
struct GraphSnapshot<'a> {
    vertices: Vec<SnapshotVertex<'a>>,
}

#[derive(Serialize)]
struct SnapshotVertex<'a> {
    key: &'a RecordKey,
    weight: f64,
    partition: PartitionId,
    edges: Vec<(&'a RecordKey, f64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u64) -> RecordKey {
        RecordKey::new("t", id)
    }

    fn observe(graph: &mut WeightedAccessGraph, txn: &[(u64, PartitionId)]) {
        let keys = txn.iter().map(|(id, _)| key(*id)).collect::<Vec<_>>();
        for (id, part) in txn {
            graph.record_vertex_access(&key(*id), *part);
        }
        graph.record_co_access(&keys).expect("co-access");
    }

    #[test]
    fn weights_and_edges_accumulate_symmetrically() {
        let mut graph = WeightedAccessGraph::new();
        observe(&mut graph, &[(1, 0), (2, 1)]);
        observe(&mut graph, &[(1, 0), (2, 1), (3, 1)]);

        let v1 = graph.vertex_id(&key(1)).expect("v1");
        let v2 = graph.vertex_id(&key(2)).expect("v2");
        let v3 = graph.vertex_id(&key(3)).expect("v3");
        assert_eq!(graph.vertex(v1).weight, 2.0);
        assert_eq!(graph.vertex(v3).weight, 1.0);
        assert_eq!(graph.vertex(v1).edges[&v2], 2.0);
        assert_eq!(graph.vertex(v2).edges[&v1], 2.0);
        assert_eq!(graph.vertex(v2).edges[&v3], 1.0);
        assert_eq!(graph.vertex(v3).edges[&v2], 1.0);
        assert!(!graph.vertex(v1).edges.contains_key(&v1));
    }

    #[test]
    fn duplicate_keys_in_one_transaction_do_not_self_loop() {
        let mut graph = WeightedAccessGraph::new();
        graph.record_vertex_access(&key(1), 0);
        graph
            .record_co_access(&[key(1), key(1)])
            .expect("co-access");
        assert!(graph.vertex(0).edges.is_empty());
    }

    #[test]
    fn co_access_on_unknown_key_is_rejected() {
        let mut graph = WeightedAccessGraph::new();
        graph.record_vertex_access(&key(1), 0);
        let err = graph
            .record_co_access(&[key(1), key(9)])
            .expect_err("unknown key must fail");
        assert!(err.to_string().contains("t:9"));
    }

    #[test]
    fn snapshot_total_is_local_plus_cross_from_raw_weights() {
        let mut graph = WeightedAccessGraph::new();
        observe(&mut graph, &[(1, 0), (2, 0)]);
        observe(&mut graph, &[(1, 0), (3, 1)]);
        observe(&mut graph, &[(3, 1), (4, 2), (5, 2)]);
        observe(&mut graph, &[(5, 2)]);

        let cost = 1.5;
        let loads = graph.snapshot_partitions(3, cost);
        for load in &loads {
            let mut local = 0.0;
            let mut cross = 0.0;
            for (_, v) in graph.vertices() {
                if v.partition != load.partition {
                    continue;
                }
                local += v.weight;
                for (&n, &w) in &v.edges {
                    if graph.vertex(n).partition != v.partition {
                        cross += w * cost;
                    }
                }
            }
            assert_eq!(load.local_load, local);
            assert_eq!(load.cross_load, cross);
            assert_eq!(load.total_load(), load.local_load + load.cross_load);
        }
        // Partition 0: keys 1 (w2) and 2 (w1); edge 1-3 crosses.
        assert_eq!(loads[0].local_load, 3.0);
        assert_eq!(loads[0].cross_load, 1.5);
        // Partition 1: key 3 (w2); edges 3-1, 3-4, 3-5 cross.
        assert_eq!(loads[1].local_load, 2.0);
        assert_eq!(loads[1].cross_load, 4.5);
    }

    #[test]
    fn hottest_vertex_breaks_ties_by_lowest_key() {
        let mut graph = WeightedAccessGraph::new();
        graph.record_vertex_access(&key(7), 0);
        graph.record_vertex_access(&key(3), 0);
        graph.record_vertex_access(&key(9), 1);
        graph.record_vertex_access(&key(9), 1);
        let hottest = graph.hottest_vertex(0).expect("vertex on partition 0");
        assert_eq!(graph.vertex(hottest).key, key(3));
        assert_eq!(graph.hottest_vertex(2), None);
    }

    #[test]
    fn out_of_range_partitions_are_ignored() {
        let mut graph = WeightedAccessGraph::new();
        graph.record_vertex_access(&key(1), 5);
        let loads = graph.snapshot_partitions(2, 1.0);
        assert_eq!(loads.len(), 2);
        assert!(loads.iter().all(|l| l.total_load() == 0.0));
    }

    #[test]
    fn snapshot_file_lists_every_vertex() {
        let mut graph = WeightedAccessGraph::new();
        observe(&mut graph, &[(1, 0), (2, 1)]);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("graphs").join("heat.json");
        graph.write_snapshot(&path).expect("write snapshot");

        let raw = std::fs::read(&path).expect("read snapshot");
        let value: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        let vertices = value["vertices"].as_array().expect("vertices array");
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[0]["key"]["id"], 1);
        assert_eq!(vertices[0]["edges"].as_array().map(Vec::len), Some(1));
    }
}
