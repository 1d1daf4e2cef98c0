//! The vector index: an HNSW graph plus a linear "pending" segment.
//!
//! `instant-distance` builds immutable graphs, so fresh inserts land in the
//! pending segment (scanned linearly on search) and deletes become
//! tombstones filtered on read. `rebuild` folds everything into a new graph
//! and swaps it in under the write lock. Vectors are L2-normalized on entry;
//! Euclidean distance on unit vectors is monotone in cosine similarity, and
//! scores map back through `cos = 1 - d²/2`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use instant_distance::{Builder, HnswMap, Point, Search};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone)]
pub struct VectorPoint(pub Vec<f32>);

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// On-disk snapshot: raw vectors only. The graph is rebuilt on load — the
/// build is cheap at memory-store scale and keeps the file format trivial.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    dim: usize,
    entries: Vec<(i64, Vec<f32>)>,
}

struct IndexState {
    graph: Option<HnswMap<VectorPoint, i64>>,
    /// Vectors baked into the graph, by id (tombstones excluded on read, not
    /// removed — HNSW cannot truly delete).
    graph_vectors: HashMap<i64, VectorPoint>,
    /// Inserts since the last rebuild, scanned linearly.
    pending: HashMap<i64, VectorPoint>,
    tombstones: HashSet<i64>,
}

pub struct VectorIndex {
    state: RwLock<IndexState>,
    dim: usize,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            state: RwLock::new(IndexState {
                graph: None,
                graph_vectors: HashMap::new(),
                pending: HashMap::new(),
                tombstones: HashSet::new(),
            }),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Live entries (graph + pending, minus tombstones).
    pub fn live_len(&self) -> usize {
        let state = self.state.read().unwrap();
        let graph_live = state
            .graph_vectors
            .keys()
            .filter(|id| !state.tombstones.contains(id) && !state.pending.contains_key(id))
            .count();
        let pending_live = state
            .pending
            .keys()
            .filter(|id| !state.tombstones.contains(id))
            .count();
        graph_live + pending_live
    }

    fn check_dim(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or update one vector. Writes serialise on the write lock.
    pub fn insert(&self, id: i64, vector: Vec<f32>) -> Result<()> {
        self.check_dim(&vector)?;
        let point = VectorPoint(normalize(vector));
        let mut state = self.state.write().unwrap();
        state.tombstones.remove(&id);
        state.pending.insert(id, point);
        Ok(())
    }

    /// Tombstone one id. The HNSW graph cannot truly delete, so reads filter
    /// against the tombstone set until the next rebuild.
    pub fn remove(&self, id: i64) {
        let mut state = self.state.write().unwrap();
        state.pending.remove(&id);
        state.tombstones.insert(id);
    }

    /// Top-`k` live entries by cosine similarity, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        self.check_dim(query)?;
        let point = VectorPoint(normalize(query.to_vec()));
        let state = self.state.read().unwrap();

        let mut hits: HashMap<i64, f32> = HashMap::new();

        if let Some(ref graph) = state.graph {
            let mut search = Search::default();
            for item in graph.search(&point, &mut search) {
                let id = *item.value;
                if state.tombstones.contains(&id) || state.pending.contains_key(&id) {
                    continue;
                }
                hits.entry(id).or_insert_with(|| similarity(item.distance));
            }
        }

        for (id, candidate) in &state.pending {
            if state.tombstones.contains(id) {
                continue;
            }
            let d = point.distance(candidate);
            hits.insert(*id, similarity(d));
        }

        let mut out: Vec<(i64, f32)> = hits.into_iter().collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(k);
        Ok(out)
    }

    /// Rebuild from authoritative rows and swap atomically.
    ///
    /// The new graph is constructed before the write lock is taken; the lock
    /// only covers the pointer swap and the bookkeeping reset.
    pub fn rebuild(&self, rows: Vec<(i64, Vec<f32>)>) -> Result<()> {
        let mut points = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        let mut by_id = HashMap::with_capacity(rows.len());
        for (id, vector) in rows {
            self.check_dim(&vector)?;
            let point = VectorPoint(normalize(vector));
            points.push(point.clone());
            values.push(id);
            by_id.insert(id, point);
        }

        let graph = if points.is_empty() {
            None
        } else {
            Some(Builder::default().build(points, values))
        };

        let mut state = self.state.write().unwrap();
        state.graph = graph;
        state.graph_vectors = by_id;
        state.pending.clear();
        state.tombstones.clear();
        info!(entries = state.graph_vectors.len(), "vector index rebuilt");
        Ok(())
    }

    /// Write a snapshot of all live vectors.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.read().unwrap();
        let mut entries: Vec<(i64, Vec<f32>)> = Vec::new();
        for (id, point) in &state.graph_vectors {
            if !state.tombstones.contains(id) && !state.pending.contains_key(id) {
                entries.push((*id, point.0.clone()));
            }
        }
        for (id, point) in &state.pending {
            if !state.tombstones.contains(id) {
                entries.push((*id, point.0.clone()));
            }
        }
        drop(state);

        let snapshot = Snapshot {
            dim: self.dim,
            entries,
        };
        let file = std::fs::File::create(path).map_err(|e| MemoryError::Snapshot(e.to_string()))?;
        ciborium::into_writer(&snapshot, file).map_err(|e| MemoryError::Snapshot(e.to_string()))?;
        debug!(path = %path.display(), "vector index snapshot written");
        Ok(())
    }

    /// Load a snapshot written by [`VectorIndex::save`] and rebuild from it.
    pub fn load(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::open(path).map_err(|e| MemoryError::Snapshot(e.to_string()))?;
        let snapshot: Snapshot =
            ciborium::from_reader(file).map_err(|e| MemoryError::Snapshot(e.to_string()))?;
        if snapshot.dim != self.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dim,
                got: snapshot.dim,
            });
        }
        let n = snapshot.entries.len();
        self.rebuild(snapshot.entries)?;
        Ok(n)
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Map Euclidean distance between unit vectors onto `[0, 1]` similarity.
fn similarity(distance: f32) -> f32 {
    let cos = 1.0 - (distance * distance) / 2.0;
    cos.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn insert_then_search_finds_self() {
        let idx = VectorIndex::new(4);
        idx.insert(1, unit(4, 0)).unwrap();
        idx.insert(2, unit(4, 1)).unwrap();
        let hits = idx.search(&unit(4, 0), 2).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn tombstone_hides_until_rebuild() {
        let idx = VectorIndex::new(4);
        idx.insert(1, unit(4, 0)).unwrap();
        idx.remove(1);
        assert!(idx.search(&unit(4, 0), 4).unwrap().is_empty());
        assert_eq!(idx.live_len(), 0);

        // rebuild without the row keeps it gone; re-adding revives it
        idx.rebuild(vec![(2, unit(4, 1))]).unwrap();
        let hits = idx.search(&unit(4, 1), 4).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn rebuild_folds_pending_into_graph() {
        let idx = VectorIndex::new(4);
        let rows: Vec<(i64, Vec<f32>)> = (0..4).map(|i| (i as i64, unit(4, i))).collect();
        idx.rebuild(rows).unwrap();
        idx.insert(10, unit(4, 2)).unwrap();

        let hits = idx.search(&unit(4, 2), 4).unwrap();
        // pending insert wins over the graph entry with the same vector
        assert!(hits.iter().any(|(id, _)| *id == 10));
        assert_eq!(idx.live_len(), 5);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let idx = VectorIndex::new(4);
        assert!(matches!(
            idx.insert(1, vec![1.0; 3]),
            Err(MemoryError::DimensionMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.hnsw");

        let idx = VectorIndex::new(4);
        idx.insert(7, unit(4, 3)).unwrap();
        idx.insert(8, unit(4, 1)).unwrap();
        idx.remove(8);
        idx.save(&path).unwrap();

        let restored = VectorIndex::new(4);
        assert_eq!(restored.load(&path).unwrap(), 1);
        let hits = restored.search(&unit(4, 3), 2).unwrap();
        assert_eq!(hits[0].0, 7);
    }
}
