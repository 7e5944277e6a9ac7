//! HNSW (Hierarchical Navigable Small World) approximate nearest-neighbor index.
//!
//! A multi-layer proximity graph over cosine distance:
//! - Higher layers hold exponentially fewer nodes.
//! - Search descends greedily from the top layer, then runs a beam search of
//!   width `ef` on layer 0.
//! - `m` bounds per-node links (`2 * m` on layer 0). `ef_construction` is the
//!   beam width used while linking new nodes.
//!
//! Query breadth (`ef_search`) is passed per call, so recall and latency can be
//! traded at runtime without rebuilding the graph. Deletes are soft: deleted
//! nodes still route traffic but are never returned.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::embedding::cosine_distance;
use crate::error::{RagError, RagResult};

/// Graph construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HnswParams {
    /// Max links per node on upper layers.
    pub m: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    vector: Vec<f32>,
    /// `links[level]` holds neighbor ids on that level.
    links: Vec<Vec<i64>>,
    deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    id: i64,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// In-memory HNSW graph keyed by `i64` ids.
#[derive(Debug, Clone)]
pub struct HnswIndex {
    params: HnswParams,
    m_max0: usize,
    level_mult: f64,
    dimension: usize,
    nodes: HashMap<i64, Node>,
    entry_point: Option<i64>,
    top_level: usize,
    deleted: usize,
    rng_state: u64,
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        let m = params.m.max(2);
        Self {
            params: HnswParams {
                m,
                ef_construction: params.ef_construction.max(m),
            },
            m_max0: m * 2,
            level_mult: 1.0 / (m as f64).ln(),
            dimension,
            nodes: HashMap::new(),
            entry_point: None,
            top_level: 0,
            deleted: 0,
            rng_state: 42,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Number of live (not deleted) nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: i64) -> bool {
        self.nodes.get(&id).map(|n| !n.deleted).unwrap_or(false)
    }

    /// Insert `vector` under `id`. Re-inserting a known id replaces its vector.
    pub fn insert(&mut self, id: i64, vector: Vec<f32>) -> RagResult<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.vector = vector;
            if node.deleted {
                node.deleted = false;
                self.deleted -= 1;
            }
            return Ok(());
        }

        let level = self.random_level();
        let Some(mut entry) = self.entry_point else {
            self.nodes.insert(
                id,
                Node {
                    vector,
                    links: vec![Vec::new(); level + 1],
                    deleted: false,
                },
            );
            self.entry_point = Some(id);
            self.top_level = level;
            return Ok(());
        };

        for lc in ((level + 1)..=self.top_level).rev() {
            entry = self.greedy_closest(entry, &vector, lc);
        }

        let mut layer_links: Vec<Vec<i64>> = vec![Vec::new(); level + 1];
        for lc in (0..=level.min(self.top_level)).rev() {
            let found = self.search_layer(&[entry], &vector, self.params.ef_construction, lc);
            let limit = self.max_links(lc);
            layer_links[lc] = found.iter().take(limit).map(|s| s.id).collect();
            if let Some(best) = found.first() {
                entry = best.id;
            }
        }

        self.nodes.insert(
            id,
            Node {
                vector,
                links: layer_links.clone(),
                deleted: false,
            },
        );

        for (lc, neighbors) in layer_links.iter().enumerate() {
            for &neighbor in neighbors {
                self.link(neighbor, id, lc);
            }
        }

        if level > self.top_level {
            self.top_level = level;
            self.entry_point = Some(id);
        }
        Ok(())
    }

    /// Soft-delete `id`. Returns false when the id is unknown or already deleted.
    pub fn remove(&mut self, id: i64) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if !node.deleted => {
                node.deleted = true;
                self.deleted += 1;
                true
            }
            _ => false,
        }
    }

    /// Return up to `k` live ids closest to `query` as `(id, cosine_distance)`,
    /// nearest first. The beam width is `max(k, ef_search)`.
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(i64, f32)> {
        if k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };

        for lc in (1..=self.top_level).rev() {
            entry = self.greedy_closest(entry, query, lc);
        }

        let ef = ef_search.max(k);
        self.search_layer(&[entry], query, ef, 0)
            .into_iter()
            .filter(|s| self.contains(s.id))
            .take(k)
            .map(|s| (s.id, s.distance))
            .collect()
    }

    /// Exhaustive scan, used to verify recall and for tiny indexes.
    pub fn brute_force(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let mut all: Vec<Scored> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.deleted)
            .map(|(id, n)| Scored {
                distance: cosine_distance(query, &n.vector),
                id: *id,
            })
            .collect();
        all.sort();
        all.into_iter().take(k).map(|s| (s.id, s.distance)).collect()
    }

    fn max_links(&self, level: usize) -> usize {
        if level == 0 {
            self.m_max0
        } else {
            self.params.m
        }
    }

    fn distance(&self, id: i64, query: &[f32]) -> f32 {
        self.nodes
            .get(&id)
            .map(|n| cosine_distance(query, &n.vector))
            .unwrap_or(f32::MAX)
    }

    fn greedy_closest(&self, start: i64, query: &[f32], level: usize) -> i64 {
        let mut current = start;
        let mut current_dist = self.distance(current, query);
        loop {
            let mut changed = false;
            if let Some(node) = self.nodes.get(&current) {
                if let Some(links) = node.links.get(level) {
                    for &nid in links {
                        let d = self.distance(nid, query);
                        if d < current_dist {
                            current = nid;
                            current_dist = d;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                return current;
            }
        }
    }

    /// Beam search on one layer; returns up to `ef` nodes sorted nearest first.
    fn search_layer(&self, entries: &[i64], query: &[f32], ef: usize, level: usize) -> Vec<Scored> {
        let mut visited: HashSet<i64> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &id in entries {
            if visited.insert(id) {
                let s = Scored {
                    distance: self.distance(id, query),
                    id,
                };
                candidates.push(Reverse(s));
                results.push(s);
            }
        }

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = results.peek().map(|s| s.distance).unwrap_or(f32::MAX);
            if current.distance > worst && results.len() >= ef {
                break;
            }
            let Some(node) = self.nodes.get(&current.id) else {
                continue;
            };
            let Some(links) = node.links.get(level) else {
                continue;
            };
            for &nid in links {
                if !visited.insert(nid) {
                    continue;
                }
                let d = self.distance(nid, query);
                let worst = results.peek().map(|s| s.distance).unwrap_or(f32::MAX);
                if results.len() < ef || d < worst {
                    let s = Scored { distance: d, id: nid };
                    candidates.push(Reverse(s));
                    results.push(s);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn link(&mut self, from: i64, to: i64, level: usize) {
        let limit = self.max_links(level);
        let Some(node) = self.nodes.get_mut(&from) else {
            return;
        };
        while node.links.len() <= level {
            node.links.push(Vec::new());
        }
        if node.links[level].contains(&to) {
            return;
        }
        node.links[level].push(to);
        if node.links[level].len() <= limit {
            return;
        }

        let base = node.vector.clone();
        let current = node.links[level].clone();
        let mut scored: Vec<Scored> = current
            .into_iter()
            .map(|id| Scored {
                distance: self.distance(id, &base),
                id,
            })
            .collect();
        scored.sort();
        scored.truncate(limit);
        if let Some(node) = self.nodes.get_mut(&from) {
            node.links[level] = scored.into_iter().map(|s| s.id).collect();
        }
    }

    fn random_level(&mut self) -> usize {
        // LCG keeps graph shape reproducible across rebuilds.
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let uniform = ((self.rng_state >> 11) as f64 / (1u64 << 53) as f64).max(f64::MIN_POSITIVE);
        ((-uniform.ln()) * self.level_mult).floor().min(16.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                (0..dims)
                    .map(|_| {
                        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                        ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_exact_match_is_first() {
        let mut index = HnswIndex::new(3, HnswParams::default());
        index.insert(1, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(2, vec![0.0, 1.0, 0.0]).unwrap();
        index.insert(3, vec![0.0, 0.0, 1.0]).unwrap();
        let hits = index.search(&[0.9, 0.1, 0.0], 2, 16);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = HnswIndex::new(4, HnswParams::default());
        let err = index.insert(1, vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 4, actual: 2 }));
    }

    #[test]
    fn test_recall_against_brute_force() {
        let dims = 16;
        let data = pseudo_random_vectors(300, dims, 7);
        let mut index = HnswIndex::new(dims, HnswParams { m: 12, ef_construction: 64 });
        for (i, v) in data.iter().enumerate() {
            index.insert(i as i64, v.clone()).unwrap();
        }
        let queries = pseudo_random_vectors(20, dims, 99);
        let mut found = 0;
        for q in &queries {
            let exact: HashSet<i64> = index.brute_force(q, 10).into_iter().map(|(id, _)| id).collect();
            found += index
                .search(q, 10, 80)
                .into_iter()
                .filter(|(id, _)| exact.contains(id))
                .count();
        }
        let recall = found as f64 / (queries.len() * 10) as f64;
        assert!(recall >= 0.9, "recall too low: {}", recall);
    }

    #[test]
    fn test_soft_delete_hides_node() {
        let mut index = HnswIndex::new(2, HnswParams::default());
        index.insert(10, vec![1.0, 0.0]).unwrap();
        index.insert(11, vec![0.0, 1.0]).unwrap();
        assert!(index.remove(10));
        assert!(!index.remove(10));
        assert_eq!(index.len(), 1);
        let hits = index.search(&[1.0, 0.0], 5, 16);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 11);
    }

    #[test]
    fn test_wider_search_never_loses_results() {
        let data = pseudo_random_vectors(150, 8, 3);
        let mut index = HnswIndex::new(8, HnswParams { m: 4, ef_construction: 8 });
        for (i, v) in data.iter().enumerate() {
            index.insert(i as i64, v.clone()).unwrap();
        }
        let q = &data[17];
        let narrow = index.search(q, 5, 5);
        let wide = index.search(q, 5, 150);
        assert_eq!(wide[0].0, 17);
        assert!(wide[4].1 <= narrow[4].1 + 1e-6);
    }
}
