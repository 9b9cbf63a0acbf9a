//! Storage abstraction for the bot: an ordered key-value store.
//!
//! The [`DB`] trait defines the minimal storage surface the rest of the
//! crate builds on — ordered byte keys, end-inclusive range scans,
//! atomic batches, and named cross-client locks — enabling pluggable
//! backends. Two implementations ship with the crate:
//!
//! - [`MemDB`] — an in-memory `BTreeMap` engine, the workhorse of the
//!   test suite.
//! - [`disk::SledDB`] — a persistent engine backed by the `sled`
//!   embedded key-value store, used by the running bot.
//!
//! The needs are intentionally minimal (no SQL, no schema) so that
//! hosted key-value services can back the same trait later.
//!
//! # Failure discipline
//!
//! `DB` operations are assumed not to fail. If the engine reports an
//! error, or a client decodes corrupt data, the operation panics via
//! [`DB::panic_corrupt`] — the program cannot do anything useful
//! without its database, and limping on through untested error paths
//! is worse than stopping. Code running multiple parallel operations
//! can recover at its outermost call.
//!
//! # Batches
//!
//! A [`Batch`] accumulates mutations and applies them as a single
//! atomic unit, in the order they were staged: `set(a)` then
//! `delete(a)` leaves `a` absent. For bulk loops where atomicity of
//! the whole run is not needed, [`Batch::maybe_apply`] lets the
//! implementation flush at safe points once the staged bytes pass a
//! soft bound (~100 MB).

pub mod disk;
pub mod timed;
pub mod vector;

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::{Condvar, Mutex, RwLock};

use crate::ordered;

/// Soft bound on staged batch bytes before [`Batch::maybe_apply`] flushes.
const MAX_BATCH_BYTES: usize = 100 << 20;

/// An ordered key-value database.
///
/// All methods use the panic failure discipline described in the
/// module docs; none of them return errors.
pub trait DB: Send + Sync {
    /// Acquires the named lock, blocking until it is free.
    ///
    /// The name need not correspond to any stored key. Across every
    /// client of the same database, at most one holder of a given name
    /// exists at a time.
    fn lock(&self, name: &str);

    /// Releases the named lock. Panics if the name is not locked.
    fn unlock(&self, name: &str);

    /// Looks up the value stored under `key`.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Sets `key` to `val`, overwriting any previous value.
    fn set(&self, key: &[u8], val: &[u8]);

    /// Deletes any value stored under `key`. Deleting an absent key is
    /// a no-op.
    fn delete(&self, key: &[u8]);

    /// Deletes every key-value pair with `start <= key <= end`.
    fn delete_range(&self, start: &[u8], end: &[u8]);

    /// Returns an ascending iterator over all pairs with
    /// `start <= key <= end`. Consumers may stop early.
    fn scan<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a>;

    /// Returns a new empty [`Batch`] against this database.
    fn batch<'a>(&'a self) -> Box<dyn Batch + Send + 'a>;

    /// Makes all previously applied writes durable.
    fn flush(&self);

    /// Releases resources held by the database. Use after close is
    /// undefined.
    fn close(&self);

    /// Logs `msg` with the given structured fields at error level and
    /// then panics. Called on corruption and other "can't happen"
    /// conditions detected by the engine or its clients.
    fn panic_corrupt(&self, msg: &str, fields: &[(&str, &str)]) -> ! {
        panic_corrupt(msg, fields)
    }
}

/// An atomic group of mutations against a [`DB`].
pub trait Batch {
    /// Stages a set of `key` to `val`.
    fn set(&mut self, key: &[u8], val: &[u8]);

    /// Stages a delete of `key`.
    fn delete(&mut self, key: &[u8]);

    /// Stages deletion of every pair with `start <= key <= end`.
    fn delete_range(&mut self, start: &[u8], end: &[u8]);

    /// Calls [`Batch::apply`] if the staged operations have grown past
    /// the soft size bound, reporting whether it did. Callers invoke
    /// this at safe points in bulk loops where atomicity of the whole
    /// loop is not required.
    fn maybe_apply(&mut self) -> bool;

    /// Applies all staged operations atomically, in order, leaving the
    /// batch empty and reusable.
    fn apply(&mut self);
}

/// Logs a corruption report and panics with the same text.
///
/// DB implementations call this directly; clients holding a `DB` use
/// [`DB::panic_corrupt`] instead.
pub fn panic_corrupt(msg: &str, fields: &[(&str, &str)]) -> ! {
    let mut text = String::from(msg);
    for (k, v) in fields {
        text.push_str(&format!(" {k}={v}"));
    }
    tracing::error!("{text}");
    panic!("{text}");
}

/// Serializes `x` to JSON, panicking on failure.
///
/// Whether a value can be serialized depends almost entirely on its
/// type, so an error here is a bug at the call site, not an I/O
/// condition worth propagating.
pub fn to_json<T: serde::Serialize>(x: &T) -> Vec<u8> {
    match serde_json::to_vec(x) {
        Ok(js) => js,
        Err(e) => panic!("to_json: {e}"),
    }
}

/// A table of named advisory locks shared by the in-process engines.
///
/// Lock names are arbitrary strings; holders block in [`NamedLocks::lock`]
/// until the name is free. Both [`MemDB`] and [`disk::SledDB`] embed
/// one of these, which is sufficient because each engine admits only a
/// single process (sled itself locks the database directory).
#[derive(Default)]
pub struct NamedLocks {
    held: Mutex<HashSet<String>>,
    freed: Condvar,
}

impl NamedLocks {
    /// Blocks until `name` is unheld, then takes it.
    pub fn lock(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        while held.contains(name) {
            held = self.freed.wait(held).unwrap();
        }
        held.insert(name.to_string());
    }

    /// Releases `name`. Panics if it was not held.
    pub fn unlock(&self, name: &str) {
        let mut held = self.held.lock().unwrap();
        if !held.remove(name) {
            drop(held);
            panic_corrupt("unlock of never-locked name", &[("name", name)]);
        }
        self.freed.notify_all();
    }
}

/// Holds a named database lock for a lexical scope, releasing it on
/// drop so that early returns and panics cannot leak the lock.
pub struct LockGuard<'a> {
    db: &'a dyn DB,
    name: String,
}

impl<'a> LockGuard<'a> {
    /// Acquires `name` on `db` and returns the holding guard.
    pub fn acquire(db: &'a dyn DB, name: &str) -> LockGuard<'a> {
        db.lock(name);
        LockGuard {
            db,
            name: name.to_string(),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.db.unlock(&self.name);
    }
}

/// An in-memory [`DB`] implementation.
///
/// All data lives in a `BTreeMap` behind a read-write lock; scans
/// snapshot the requested range so that iteration never observes a
/// half-applied batch.
#[derive(Default)]
pub struct MemDB {
    locks: NamedLocks,
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDB {
    pub fn new() -> MemDB {
        MemDB::default()
    }
}

impl DB for MemDB {
    fn lock(&self, name: &str) {
        self.locks.lock(name);
    }

    fn unlock(&self, name: &str) {
        self.locks.unlock(name);
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &[u8], val: &[u8]) {
        self.data
            .write()
            .unwrap()
            .insert(key.to_vec(), val.to_vec());
    }

    fn delete(&self, key: &[u8]) {
        self.data.write().unwrap().remove(key);
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) {
        let mut data = self.data.write().unwrap();
        let doomed: Vec<Vec<u8>> = data
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            data.remove(&k);
        }
    }

    fn scan<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a> {
        let data = self.data.read().unwrap();
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = data
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(snapshot.into_iter())
    }

    fn batch<'a>(&'a self) -> Box<dyn Batch + Send + 'a> {
        Box::new(MemBatch {
            db: self,
            ops: Vec::new(),
            bytes: 0,
        })
    }

    fn flush(&self) {
        // Memory is as durable as this engine gets.
    }

    fn close(&self) {}
}

enum Op {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    DeleteRange(Vec<u8>, Vec<u8>),
}

struct MemBatch<'a> {
    db: &'a MemDB,
    ops: Vec<Op>,
    bytes: usize,
}

impl Batch for MemBatch<'_> {
    fn set(&mut self, key: &[u8], val: &[u8]) {
        self.bytes += key.len() + val.len();
        self.ops.push(Op::Set(key.to_vec(), val.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.bytes += key.len();
        self.ops.push(Op::Delete(key.to_vec()));
    }

    fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        self.bytes += start.len() + end.len();
        self.ops
            .push(Op::DeleteRange(start.to_vec(), end.to_vec()));
    }

    fn maybe_apply(&mut self) -> bool {
        if self.bytes < MAX_BATCH_BYTES {
            return false;
        }
        self.apply();
        true
    }

    fn apply(&mut self) {
        let mut data = self.db.data.write().unwrap();
        for op in self.ops.drain(..) {
            match op {
                Op::Set(k, v) => {
                    data.insert(k, v);
                }
                Op::Delete(k) => {
                    data.remove(&k);
                }
                Op::DeleteRange(start, end) => {
                    let doomed: Vec<Vec<u8>> = data
                        .range::<[u8], _>((Bound::Included(&start[..]), Bound::Included(&end[..])))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        data.remove(&k);
                    }
                }
            }
        }
        self.bytes = 0;
    }
}

/// Formats possibly-encoded key or value bytes for log messages.
///
/// Thin re-export of [`ordered::fmt`] so storage clients do not need a
/// second import for their panic paths.
pub fn fmt(data: &[u8]) -> String {
    ordered::fmt(data)
}
