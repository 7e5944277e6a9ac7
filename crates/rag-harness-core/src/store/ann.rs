//! One HNSW graph per `(modality, model_id)`, shared by every store backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::error::RagResult;
use crate::hnsw::{HnswIndex, HnswParams};
use crate::models::Modality;

type GraphKey = (Modality, String);

/// Set of approximate-nearest-neighbor graphs with a runtime-tunable `ef_search`.
#[derive(Debug)]
pub struct AnnIndexes {
    params: HnswParams,
    ef_search: AtomicUsize,
    graphs: RwLock<HashMap<GraphKey, HnswIndex>>,
}

impl AnnIndexes {
    pub fn new(params: HnswParams, ef_search: usize) -> Self {
        Self {
            params,
            ef_search: AtomicUsize::new(ef_search.max(1)),
            graphs: RwLock::new(HashMap::new()),
        }
    }

    pub fn ef_search(&self) -> usize {
        self.ef_search.load(Ordering::Relaxed)
    }

    /// Change query breadth. Takes effect on the next search; graphs are untouched.
    pub fn set_ef_search(&self, ef_search: usize) {
        self.ef_search.store(ef_search.max(1), Ordering::Relaxed);
    }

    pub fn insert(&self, modality: Modality, model_id: &str, id: i64, vector: Vec<f32>) -> RagResult<()> {
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        let dim = vector.len();
        graphs
            .entry((modality, model_id.to_string()))
            .or_insert_with(|| HnswIndex::new(dim, self.params))
            .insert(id, vector)
    }

    /// Soft-delete `id` from every graph it appears in.
    pub fn remove(&self, id: i64) {
        let mut graphs = self.graphs.write().unwrap_or_else(|e| e.into_inner());
        for graph in graphs.values_mut() {
            graph.remove(id);
        }
    }

    pub fn search(&self, modality: Modality, model_id: &str, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        match graphs.get(&(modality, model_id.to_string())) {
            Some(graph) => graph.search(query, k, self.ef_search()),
            None => Vec::new(),
        }
    }

    pub fn clear(&self) {
        self.graphs.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Live vectors across all graphs.
    pub fn len(&self) -> usize {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        graphs.values().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphs_are_keyed_by_model() {
        let ann = AnnIndexes::new(HnswParams::default(), 32);
        ann.insert(Modality::Docs, "a", 1, vec![1.0, 0.0]).unwrap();
        ann.insert(Modality::Docs, "b", 2, vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(ann.search(Modality::Docs, "a", &[1.0, 0.0], 5), vec![(1, 0.0)]);
        assert_eq!(ann.search(Modality::Docs, "b", &[1.0, 0.0, 0.0], 5).len(), 1);
        assert!(ann.search(Modality::Code, "a", &[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_ef_search_changes_without_rebuild() {
        let ann = AnnIndexes::new(HnswParams::default(), 16);
        for i in 0..50 {
            let v = vec![(i as f32).cos(), (i as f32).sin()];
            ann.insert(Modality::Docs, "m", i, v).unwrap();
        }
        let before = ann.search(Modality::Docs, "m", &[1.0, 0.0], 3);
        ann.set_ef_search(200);
        assert_eq!(ann.ef_search(), 200);
        let after = ann.search(Modality::Docs, "m", &[1.0, 0.0], 3);
        assert_eq!(ann.len(), 50);
        assert_eq!(after[0].0, 0);
        assert!(after[2].1 <= before[2].1 + 1e-6);
    }
}
