//! Persistent [`DB`] engine backed by the `sled` embedded key-value store.
//!
//! sled already provides ordered byte keys, atomic batches, and
//! crash-safe flushing, so this module is mostly a thin adapter that
//! maps engine errors onto the storage panic discipline. sled locks
//! the database directory, so a database is owned by a single process
//! and the in-process [`NamedLocks`] table satisfies the cross-client
//! locking contract.
//!
//! sled batches carry only point operations, so a staged
//! `delete_range` is expanded into per-key deletes against the keys
//! visible when it is staged. All range deletions in this crate happen
//! under a lock that serializes writers to the affected range, so the
//! expansion observes every key the range will ever hold.

use std::ops::Bound;
use std::path::Path;

use anyhow::{Context, Result};

use super::{Batch, NamedLocks, DB, MAX_BATCH_BYTES};

/// A [`DB`] stored in a sled database directory.
pub struct SledDB {
    db: sled::Db,
    locks: NamedLocks,
}

impl SledDB {
    /// Opens (creating if needed) the sled database at `path`.
    pub fn open(path: &Path) -> Result<SledDB> {
        let db = sled::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        tracing::info!(path = %path.display(), "opened database");
        Ok(SledDB {
            db,
            locks: NamedLocks::default(),
        })
    }
}

impl DB for SledDB {
    fn lock(&self, name: &str) {
        self.locks.lock(name);
    }

    fn unlock(&self, name: &str) {
        self.locks.unlock(name);
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.db.get(key) {
            Ok(v) => v.map(|iv| iv.to_vec()),
            Err(e) => self.panic_corrupt("sled get", &[("err", &e.to_string())]),
        }
    }

    fn set(&self, key: &[u8], val: &[u8]) {
        if let Err(e) = self.db.insert(key, val) {
            self.panic_corrupt("sled set", &[("err", &e.to_string())]);
        }
    }

    fn delete(&self, key: &[u8]) {
        if let Err(e) = self.db.remove(key) {
            self.panic_corrupt("sled delete", &[("err", &e.to_string())]);
        }
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) {
        for item in self
            .db
            .range::<&[u8], _>((Bound::Included(start), Bound::Included(end)))
        {
            match item {
                Ok((k, _)) => self.delete(&k),
                Err(e) => self.panic_corrupt("sled delete_range", &[("err", &e.to_string())]),
            }
        }
    }

    fn scan<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a> {
        let iter = self
            .db
            .range::<&[u8], _>((Bound::Included(start), Bound::Included(end)));
        Box::new(iter.map(|item| match item {
            Ok((k, v)) => (k.to_vec(), v.to_vec()),
            Err(e) => super::panic_corrupt("sled scan", &[("err", &e.to_string())]),
        }))
    }

    fn batch<'a>(&'a self) -> Box<dyn Batch + Send + 'a> {
        Box::new(SledBatch {
            db: self,
            batch: sled::Batch::default(),
            bytes: 0,
        })
    }

    fn flush(&self) {
        if let Err(e) = self.db.flush() {
            self.panic_corrupt("sled flush", &[("err", &e.to_string())]);
        }
    }

    fn close(&self) {
        self.flush();
    }
}

struct SledBatch<'a> {
    db: &'a SledDB,
    batch: sled::Batch,
    bytes: usize,
}

impl Batch for SledBatch<'_> {
    fn set(&mut self, key: &[u8], val: &[u8]) {
        self.bytes += key.len() + val.len();
        self.batch.insert(key, val);
    }

    fn delete(&mut self, key: &[u8]) {
        self.bytes += key.len();
        self.batch.remove(key);
    }

    fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        let db = self.db;
        for item in db
            .db
            .range::<&[u8], _>((Bound::Included(start), Bound::Included(end)))
        {
            match item {
                Ok((k, _)) => self.delete(&k),
                Err(e) => db.panic_corrupt("sled batch delete_range", &[("err", &e.to_string())]),
            }
        }
    }

    fn maybe_apply(&mut self) -> bool {
        if self.bytes < MAX_BATCH_BYTES {
            return false;
        }
        self.apply();
        true
    }

    fn apply(&mut self) {
        let staged = std::mem::take(&mut self.batch);
        if let Err(e) = self.db.db.apply_batch(staged) {
            self.db
                .panic_corrupt("sled batch apply", &[("err", &e.to_string())]);
        }
        self.bytes = 0;
    }
}
