//! Vector storage with in-memory nearest-neighbor search.
//!
//! [`VectorDB`] persists embedding vectors in an underlying [`DB`]
//! under keys `("Vector", namespace, id)` and keeps a full copy of the
//! namespace in memory, searching by brute-force dot product against
//! every cached vector. The vectors stored here are unit length, so
//! the dot product is the cosine similarity.
//!
//! Brute force is deliberate: at roughly 3 kB per cached vector, a
//! million documents fit in a few gigabytes and scan in tens of
//! milliseconds, which is far below the rate at which an issue tracker
//! produces new issues. An approximate index would add moving parts
//! without buying anything at this scale.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::embedding::Vector;
use crate::okey;
use crate::ordered::{self, Elem};
use crate::storage::{fmt, Batch, DB};

/// A single id returned by [`VectorDB::search`].
#[derive(Clone, Debug, PartialEq)]
pub struct VectorResult {
    /// Document ID.
    pub id: String,
    /// Similarity score in [0, 1]; 1 is an exact match.
    pub score: f64,
}

/// A persistent vector set with cached brute-force search.
///
/// The namespace is part of every key, so multiple independent vector
/// databases can share one [`DB`]. Construction loads every previously
/// stored vector in the namespace; afterward all changes must go
/// through [`VectorDB::set`] or a [`VectorBatch`] so the cache stays
/// coherent with the store.
pub struct VectorDB {
    db: Arc<dyn DB>,
    namespace: String,
    cache: RwLock<HashMap<String, Vector>>,
}

impl VectorDB {
    /// Opens the vector database for `namespace`, reading all stored
    /// vectors into memory.
    pub fn new(db: Arc<dyn DB>, namespace: &str) -> VectorDB {
        let mut cache = HashMap::new();
        for (key, val) in db.scan(
            &okey!("Vector", namespace),
            &okey!("Vector", namespace, Elem::Inf),
        ) {
            let id = match ordered::decode(&key) {
                Ok(elems) if elems.len() == 3 => elems[2].as_str().map(str::to_string),
                _ => None,
            };
            let Some(id) = id else {
                // unreachable unless corrupt storage
                db.panic_corrupt("vector db decode id", &[("key", &fmt(&key))]);
            };
            if val.len() % 4 != 0 {
                // unreachable unless corrupt storage
                db.panic_corrupt(
                    "vector db bad value length",
                    &[("key", &fmt(&key)), ("len", &val.len().to_string())],
                );
            }
            cache.insert(id, Vector::decode(&val));
        }
        tracing::info!(n = cache.len(), namespace, "loaded vector db");
        VectorDB {
            db,
            namespace: namespace.to_string(),
            cache: RwLock::new(cache),
        }
    }

    fn key(&self, id: &str) -> Vec<u8> {
        okey!("Vector", &self.namespace, id)
    }

    /// Stores `vec` under `id` and updates the cache.
    pub fn set(&self, id: &str, vec: &Vector) {
        self.db.set(&self.key(id), &vec.encode());
        self.cache
            .write()
            .unwrap()
            .insert(id.to_string(), vec.clone());
    }

    /// Returns the vector stored under `id`, from the cache.
    pub fn get(&self, id: &str) -> Option<Vector> {
        self.cache.read().unwrap().get(id).cloned()
    }

    /// Returns the `n` stored vectors most similar to `target`, best
    /// first, ties broken by ascending id. Vectors whose length
    /// differs from the target's are skipped.
    ///
    /// The read lock is held for the duration of the scan, so the
    /// result reflects a single consistent snapshot of the cache.
    pub fn search(&self, target: &Vector, n: usize) -> Vec<VectorResult> {
        let cache = self.cache.read().unwrap();
        let mut scored: Vec<VectorResult> = cache
            .iter()
            .filter(|(_, vec)| vec.len() == target.len())
            .map(|(id, vec)| VectorResult {
                id: id.clone(),
                score: target.dot(vec),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(n);
        scored
    }

    /// Returns a new batch of vector writes that will commit
    /// atomically with respect to both the underlying store and the
    /// cache.
    pub fn batch(&self) -> VectorBatch<'_> {
        VectorBatch {
            vdb: self,
            sb: self.db.batch(),
            staged: HashMap::new(),
        }
    }

    /// Flushes the underlying store.
    pub fn flush(&self) {
        self.db.flush();
    }
}

/// An atomic group of vector writes, wrapping a storage [`Batch`].
///
/// Applying first commits the wrapped batch, then installs the staged
/// vectors into the cache in one step under the write lock, so readers
/// never observe a partially applied vector batch.
pub struct VectorBatch<'a> {
    vdb: &'a VectorDB,
    sb: Box<dyn Batch + Send + 'a>,
    staged: HashMap<String, Vector>,
}

impl VectorBatch<'_> {
    /// Stages a write of `vec` under `id`.
    pub fn set(&mut self, id: &str, vec: &Vector) {
        self.sb.set(&self.vdb.key(id), &vec.encode());
        self.staged.insert(id.to_string(), vec.clone());
    }

    /// Applies if the wrapped storage batch has grown past its soft
    /// bound, reporting whether it did.
    pub fn maybe_apply(&mut self) -> bool {
        if !self.sb.maybe_apply() {
            return false;
        }
        self.install();
        true
    }

    /// Applies all staged writes.
    pub fn apply(&mut self) {
        self.sb.apply();
        self.install();
    }

    fn install(&mut self) {
        let mut cache = self.vdb.cache.write().unwrap();
        for (id, vec) in self.staged.drain() {
            cache.insert(id, vec);
        }
    }
}
