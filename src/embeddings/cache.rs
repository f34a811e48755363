use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Bounded in-process cache of embedding vectors keyed by exact input text.
///
/// Serves repeated queries without another provider round-trip. The pipeline
/// clears it on every delete/re-index so cached vectors never outlive the
/// corpus version they were computed against.
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: Mutex<HashMap<String, Vec<f32>>>,
    capacity: usize,
}

impl EmbeddingCache {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    #[inline]
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.entries
            .lock()
            .expect("embedding cache mutex poisoned")
            .get(text)
            .cloned()
    }

    #[inline]
    pub fn insert(&self, text: &str, vector: &[f32]) {
        let mut entries = self
            .entries
            .lock()
            .expect("embedding cache mutex poisoned");
        // Coarse eviction: dropping everything keeps the map bounded without
        // tracking recency.
        if entries.len() >= self.capacity && !entries.contains_key(text) {
            debug!("Embedding cache full ({} entries), clearing", entries.len());
            entries.clear();
        }
        entries.insert(text.to_string(), vector.to_vec());
    }

    /// Drop all cached vectors. Called whenever the indexed corpus changes.
    #[inline]
    pub fn invalidate_all(&self) {
        self.entries
            .lock()
            .expect("embedding cache mutex poisoned")
            .clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("embedding cache mutex poisoned")
            .len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
