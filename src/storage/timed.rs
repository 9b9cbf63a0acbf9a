//! Modification-time-indexed storage over a [`DB`].
//!
//! Timed storage keeps two physical rows for each logical entry
//! `(kind, key) → val`:
//!
//! ```text
//! (kind, key)                 → (modtime, val)
//! (kind+"ByTime", modtime, key) → ()
//! ```
//!
//! The "kind" is a key namespace, so many independent timed collections
//! share one database. The "modtime" ([`DBTime`]) is an opaque
//! monotonically increasing timestamp assigned when the entry was last
//! set. The by-time index is what makes incremental processing cheap:
//! a consumer remembers the largest modtime it has handled and calls
//! [`scan_after`] to visit only newer entries, in modtime order.
//!
//! [`Watcher`] packages that pattern together with a persistent cursor
//! and a database lock, so that multiple processes (or multiple tasks
//! in one process) sharing a watcher name cannot process the same
//! entries concurrently.
//!
//! Both rows of an entry are always written through one [`Batch`], so
//! readers never observe a primary row without its index row. The one
//! wrinkle is two `set` calls for the same key staged in the same
//! batch: the second cannot see the first's uncommitted index row to
//! delete it, leaving a stale index row behind. [`scan_after`] detects
//! and skips those (see its documentation).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::okey;
use crate::ordered::{self, Elem};
use crate::storage::{fmt, Batch, DB};

/// An opaque timestamp ordering writes within a kind.
///
/// Comparing two times from entries of the same kind indicates which
/// was written first; beyond that the value carries no meaning.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DBTime(pub i64);

static LAST_TIME: AtomicI64 = AtomicI64::new(0);

/// Returns the next [`DBTime`], strictly greater than every value
/// returned before it in this process.
///
/// The allocator starts from the wall clock in nanoseconds, so a
/// restarted process continues above the times persisted by the
/// previous one as long as the system clock does not run backward
/// across the restart.
fn now() -> DBTime {
    loop {
        let old = LAST_TIME.load(Ordering::SeqCst);
        let mut t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        if t <= old {
            t = old + 1;
        }
        if LAST_TIME
            .compare_exchange(old, t, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return DBTime(t);
        }
    }
}

/// A single logical entry read back from timed storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Time the entry was last set.
    pub mod_time: DBTime,
    /// Key namespace.
    pub kind: String,
    /// Key within the namespace (itself usually an ordered encoding).
    pub key: Vec<u8>,
    /// Stored value.
    pub val: Vec<u8>,
}

fn data_key(kind: &str, key: &[u8]) -> Vec<u8> {
    let mut k = okey!(kind);
    k.extend_from_slice(key);
    k
}

fn index_key(kind: &str, t: DBTime, key: &[u8]) -> Vec<u8> {
    let mut k = okey!(format!("{kind}ByTime"), t.0);
    k.extend_from_slice(key);
    k
}

fn watcher_key(kind: &str, name: &str) -> Vec<u8> {
    okey!(format!("{kind}Watcher"), name)
}

/// Stages into `b` the updates setting `(kind, key) → val`: the new
/// primary row with a freshly allocated modtime, the new index row,
/// and deletion of the previous index row if the entry already exists.
/// Returns the allocated modtime.
pub fn set(db: &dyn DB, b: &mut dyn Batch, kind: &str, key: &[u8], val: &[u8]) -> DBTime {
    let t = now();
    let dkey = data_key(kind, key);
    if let Some(old) = db.get(&dkey) {
        let old_t = match ordered::decode_prefix(&old, 1) {
            Ok((elems, _)) => elems[0].as_i64(),
            Err(_) => None,
        };
        let Some(old_t) = old_t else {
            // unreachable unless corrupt storage
            db.panic_corrupt(
                "timed set decode old",
                &[("dkey", &fmt(&dkey)), ("old", &fmt(&old))],
            );
        };
        b.delete(&index_key(kind, DBTime(old_t), key));
    }
    b.set(&index_key(kind, t, key), &[]);
    let mut dval = okey!(t.0);
    dval.extend_from_slice(val);
    b.set(&dkey, &dval);
    t
}

/// Stages into `b` the deletion of `(kind, key)` — both rows — if the
/// entry exists.
pub fn delete(db: &dyn DB, b: &mut dyn Batch, kind: &str, key: &[u8]) {
    let dkey = data_key(kind, key);
    let Some(dval) = db.get(&dkey) else {
        return;
    };
    let t = decode_entry_time(db, &dkey, &dval);
    b.delete(&dkey);
    b.delete(&index_key(kind, DBTime(t), key));
}

fn decode_entry_time(db: &dyn DB, dkey: &[u8], dval: &[u8]) -> i64 {
    match ordered::decode_prefix(dval, 1) {
        Ok((elems, _)) => match elems[0].as_i64() {
            Some(t) => t,
            // unreachable unless corrupt storage
            None => db.panic_corrupt("timed decode modtime", &[("dkey", &fmt(dkey))]),
        },
        Err(e) => db.panic_corrupt(
            "timed decode value",
            &[("dkey", &fmt(dkey)), ("err", &e.to_string())],
        ),
    }
}

/// Retrieves the entry for `(kind, key)`.
pub fn get(db: &dyn DB, kind: &str, key: &[u8]) -> Option<Entry> {
    let dkey = data_key(kind, key);
    let dval = db.get(&dkey)?;
    let t = decode_entry_time(db, &dkey, &dval);
    let val = strip_time(db, &dkey, &dval).to_vec();
    Some(Entry {
        mod_time: DBTime(t),
        kind: kind.to_string(),
        key: key.to_vec(),
        val,
    })
}

fn strip_time<'v>(db: &dyn DB, dkey: &[u8], dval: &'v [u8]) -> &'v [u8] {
    match ordered::decode_prefix(dval, 1) {
        Ok((_, rest)) => rest,
        Err(e) => db.panic_corrupt(
            "timed decode value",
            &[("dkey", &fmt(dkey)), ("err", &e.to_string())],
        ),
    }
}

/// Returns an iterator over entries of `kind` with `start <= key <= end`,
/// ordered by key.
pub fn scan<'a>(db: &'a dyn DB, kind: &str, start: &[u8], end: &[u8]) -> Scan<'a> {
    let iter = db.scan(&data_key(kind, start), &data_key(kind, end));
    Scan {
        db,
        kind: kind.to_string(),
        iter,
    }
}

/// Iterator returned by [`scan`].
pub struct Scan<'a> {
    db: &'a dyn DB,
    kind: String,
    iter: Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a>,
}

impl Iterator for Scan<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let (dkey, dval) = self.iter.next()?;
        let key = match ordered::decode_prefix(&dkey, 1) {
            Ok((_, rest)) => rest.to_vec(),
            Err(e) => self.db.panic_corrupt(
                "timed scan decode key",
                &[("dkey", &fmt(&dkey)), ("err", &e.to_string())],
            ),
        };
        let t = decode_entry_time(self.db, &dkey, &dval);
        let val = strip_time(self.db, &dkey, &dval).to_vec();
        Some(Entry {
            mod_time: DBTime(t),
            kind: self.kind.clone(),
            key,
            val,
        })
    }
}

/// Stages into `b` deletion of all entries of `kind` with
/// `start <= key <= end`, calling `b.maybe_apply()` between entries so
/// that arbitrarily large ranges can be deleted without building one
/// giant batch. The deletion is then not atomic as a whole; the caller
/// still applies the final partial batch.
pub fn delete_range(db: &dyn DB, b: &mut dyn Batch, kind: &str, start: &[u8], end: &[u8]) {
    for e in scan(db, kind, start, end) {
        b.delete(&data_key(kind, &e.key));
        b.delete(&index_key(kind, e.mod_time, &e.key));
        b.maybe_apply();
    }
}

/// Returns an iterator over entries of `kind` set after `t`, ordered
/// by modtime.
///
/// If `filter` is given, entries whose key fails it are skipped before
/// the primary row is loaded.
///
/// Two kinds of stale index rows are tolerated silently, both artifacts
/// of multiple writes to one key inside a single batch: a missing
/// primary row (set then delete) and a primary row newer than the
/// index row (set then set). An index row *newer* than its primary row
/// cannot arise from any legal write sequence and panics.
pub fn scan_after<'a>(
    db: &'a dyn DB,
    kind: &str,
    t: DBTime,
    filter: Option<Box<dyn Fn(&[u8]) -> bool + Send + 'a>>,
) -> ScanAfter<'a> {
    let start = okey!(format!("{kind}ByTime"), t.0 + 1);
    let end = okey!(format!("{kind}ByTime"), Elem::Inf);
    let iter = db.scan(&start, &end);
    ScanAfter {
        db,
        kind: kind.to_string(),
        iter,
        filter,
    }
}

/// Iterator returned by [`scan_after`].
pub struct ScanAfter<'a> {
    db: &'a dyn DB,
    kind: String,
    iter: Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a>,
    filter: Option<Box<dyn Fn(&[u8]) -> bool + Send + 'a>>,
}

impl Iterator for ScanAfter<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let (tkey, _) = self.iter.next()?;
            let (t, key) = match ordered::decode_prefix(&tkey, 2) {
                Ok((elems, rest)) => match elems[1].as_i64() {
                    Some(t) => (t, rest.to_vec()),
                    None => self
                        .db
                        .panic_corrupt("timed scan_after decode", &[("tkey", &fmt(&tkey))]),
                },
                Err(e) => self.db.panic_corrupt(
                    "timed scan_after decode",
                    &[("tkey", &fmt(&tkey)), ("err", &e.to_string())],
                ),
            };
            if let Some(filter) = &self.filter {
                if !filter(&key) {
                    continue;
                }
            }
            let dkey = data_key(&self.kind, &key);
            let Some(dval) = self.db.get(&dkey) else {
                // Stale index row from a set followed by a delete of the
                // same key within one batch. Ignore.
                continue;
            };
            let t2 = decode_entry_time(self.db, &dkey, &dval);
            if t < t2 {
                // Stale index row from two sets of the same key within
                // one batch: the second set could not see the first's
                // index row to delete it. Skip and wait for the index
                // row at t2.
                continue;
            }
            if t > t2 {
                // unreachable unless corruption: a new index row
                // pointing at old data cannot be produced by set.
                self.db.panic_corrupt(
                    "timed scan_after mismatch",
                    &[("tkey", &fmt(&tkey)), ("dkey", &fmt(&dkey))],
                );
            }
            let val = strip_time(self.db, &dkey, &dval).to_vec();
            return Some(Entry {
                mod_time: DBTime(t),
                kind: self.kind.clone(),
                key,
                val,
            });
        }
    }
}

/// A named, persistent cursor over recently modified entries of one
/// kind.
///
/// The cursor (the most recent modtime marked old) is stored in the
/// database under `(kind+"Watcher", name)`, so it survives restarts
/// and is shared by every client of the database. While an iteration
/// returned by [`Watcher::recent`] is live, the watcher holds the
/// database lock named after that key: two iterations over the same
/// `(db, kind, name)` — in this process or another — are strictly
/// serialized. Starting a second iteration from the same process while
/// one is live panics with "already locked" to diagnose simple
/// deadlocks rather than hanging.
///
/// `decode` maps each raw [`Entry`] to the watcher's item type.
pub struct Watcher<T> {
    db: Arc<dyn DB>,
    dkey: Vec<u8>,
    lock_name: String,
    kind: String,
    decode: Arc<dyn Fn(&Entry) -> T + Send + Sync>,
    locked: AtomicBool,
}

impl<T> Watcher<T> {
    /// Returns a new watcher named `name` over entries of `kind`.
    ///
    /// The name distinguishes watchers maintained for different
    /// purposes over the same kind; a future watcher constructed with
    /// the same `(db, kind, name)` resumes from the same cursor.
    pub fn new(
        db: Arc<dyn DB>,
        name: &str,
        kind: &str,
        decode: impl Fn(&Entry) -> T + Send + Sync + 'static,
    ) -> Watcher<T> {
        let dkey = watcher_key(kind, name);
        let lock_name = String::from_utf8_lossy(&dkey).into_owned();
        Watcher {
            db,
            dkey,
            lock_name,
            kind: kind.to_string(),
            decode: Arc::new(decode),
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) {
        if self.locked.load(Ordering::SeqCst) {
            self.db
                .panic_corrupt("timed watcher already locked", &[("name", &self.lock_name)]);
        }
        self.db.lock(&self.lock_name);
        self.locked.store(true, Ordering::SeqCst);
    }

    fn unlock(&self) {
        if !self.locked.load(Ordering::SeqCst) {
            // unreachable unless misused within this module
            self.db
                .panic_corrupt("timed watcher not locked", &[("name", &self.lock_name)]);
        }
        self.db.unlock(&self.lock_name);
        self.locked.store(false, Ordering::SeqCst);
    }

    fn cutoff(&self) -> DBTime {
        let Some(dval) = self.db.get(&self.dkey) else {
            return DBTime(0);
        };
        match ordered::decode(&dval)
            .ok()
            .and_then(|e| e.first().and_then(|e| e.as_i64()))
        {
            Some(t) => DBTime(t),
            // unreachable unless corrupt storage
            None => self
                .db
                .panic_corrupt("watcher cursor decode", &[("dval", &fmt(&dval))]),
        }
    }

    /// Starts an iteration over entries set after the cursor, in
    /// modtime order, acquiring the watcher's database lock for the
    /// life of the returned guard. Dropping the guard (including on
    /// early break or panic) flushes the database and releases the
    /// lock.
    pub fn recent(&self) -> Recent<'_, T> {
        self.lock();
        let cutoff = self.cutoff();
        let iter = scan_after(&*self.db, &self.kind, cutoff, None);
        Recent { w: self, iter }
    }

    /// Resets the watcher so the next iteration starts from the
    /// earliest entry, undoing every previous `mark_old`. Must not be
    /// called while an iteration is live (the lock would deadlock; the
    /// in-process check panics instead).
    pub fn restart(&self) {
        self.lock();
        self.db.delete(&self.dkey);
        self.unlock();
    }
}

/// A live iteration over a [`Watcher`]'s recent entries.
///
/// [`Recent::mark_old`] and [`Recent::flush`] live here rather than on
/// the watcher: they are only meaningful while the watcher's lock is
/// held, and tying them to the guard makes that a compile-time
/// property.
pub struct Recent<'w, T> {
    w: &'w Watcher<T>,
    iter: ScanAfter<'w>,
}

impl<T> Iterator for Recent<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.iter.next().map(|e| (self.w.decode)(&e))
    }
}

impl<T> Recent<'_, T> {
    /// Marks entries at or before `t` as old: they will not be visited
    /// by future iterations. Calls with `t` at or below the current
    /// cursor are no-ops, so non-monotone calls take the maximum.
    ///
    /// The cursor write is applied immediately but only guaranteed
    /// durable after [`Recent::flush`] (called automatically when the
    /// guard drops).
    pub fn mark_old(&mut self, t: DBTime) {
        if t <= self.w.cutoff() {
            return;
        }
        self.w.db.set(&self.w.dkey, &okey!(t.0));
    }

    /// Forces cursor changes to durable storage mid-iteration.
    pub fn flush(&self) {
        self.w.db.flush();
    }
}

impl<T> Drop for Recent<'_, T> {
    fn drop(&mut self) {
        self.flush();
        self.w.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemDB;

    fn mem() -> Arc<dyn DB> {
        Arc::new(MemDB::new())
    }

    fn set1(db: &dyn DB, kind: &str, key: &[u8], val: &[u8]) -> DBTime {
        let mut b = db.batch();
        let t = set(db, &mut *b, kind, key, val);
        b.apply();
        t
    }

    #[test]
    fn test_roundtrip() {
        let db = mem();
        let t = set1(&*db, "kindA", &okey!("k1"), b"hello");
        let e = get(&*db, "kindA", &okey!("k1")).unwrap();
        assert_eq!(e.val, b"hello");
        assert_eq!(e.mod_time, t);
        assert!(e.mod_time.0 > 0);

        // Exactly one index row exists for the entry.
        let rows: Vec<_> = db
            .scan(&okey!("kindAByTime"), &okey!("kindAByTime", Elem::Inf))
            .collect();
        assert_eq!(rows.len(), 1);

        // Updating replaces the index row rather than accumulating.
        set1(&*db, "kindA", &okey!("k1"), b"world");
        let rows: Vec<_> = db
            .scan(&okey!("kindAByTime"), &okey!("kindAByTime", Elem::Inf))
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(get(&*db, "kindA", &okey!("k1")).unwrap().val, b"world");
    }

    #[test]
    fn test_monotone_modtimes() {
        let db = mem();
        let mut last = DBTime(0);
        for i in 0..1000i64 {
            let t = set1(&*db, "mono", &okey!(i), b"");
            assert!(t > last, "modtime {t:?} not above {last:?}");
            last = t;
        }
    }

    #[test]
    fn test_get_absent() {
        let db = mem();
        assert!(get(&*db, "none", &okey!("k")).is_none());
    }

    #[test]
    fn test_scan_by_key_order() {
        let db = mem();
        // Insert out of key order; scan returns key order.
        for i in [5i64, 1, 9, 3] {
            set1(&*db, "s", &okey!(i), &i.to_be_bytes());
        }
        let got: Vec<_> = scan(&*db, "s", &okey!(1i64), &okey!(5i64)).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].val, 1i64.to_be_bytes());
        assert_eq!(got[1].val, 3i64.to_be_bytes());
        assert_eq!(got[2].val, 5i64.to_be_bytes());
    }

    #[test]
    fn test_delete() {
        let db = mem();
        set1(&*db, "d", &okey!("k"), b"v");
        let mut b = db.batch();
        delete(&*db, &mut *b, "d", &okey!("k"));
        b.apply();
        assert!(get(&*db, "d", &okey!("k")).is_none());
        let rows: Vec<_> = db
            .scan(&okey!("dByTime"), &okey!("dByTime", Elem::Inf))
            .collect();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_delete_range_is_resumable() {
        let db = mem();
        for i in 0..20i64 {
            set1(&*db, "dr", &okey!(i), b"v");
        }
        let mut b = db.batch();
        delete_range(&*db, &mut *b, "dr", &okey!(5i64), &okey!(14i64));
        b.apply();
        let left: Vec<_> = scan(&*db, "dr", &okey!(0i64), &okey!(19i64)).collect();
        assert_eq!(left.len(), 10);
        let after: Vec<_> = scan_after(&*db, "dr", DBTime(0), None).collect();
        assert_eq!(after.len(), 10);
    }

    #[test]
    fn test_scan_after_order_and_cutoff() {
        let db = mem();
        let t1 = set1(&*db, "sa", &okey!("b"), b"1");
        let t2 = set1(&*db, "sa", &okey!("a"), b"2");
        let got: Vec<_> = scan_after(&*db, "sa", DBTime(0), None).collect();
        // Modtime order, not key order.
        assert_eq!(got[0].mod_time, t1);
        assert_eq!(got[1].mod_time, t2);
        let got: Vec<_> = scan_after(&*db, "sa", t1, None).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].val, b"2");
    }

    #[test]
    fn test_scan_after_filter_skips_before_load() {
        let db = mem();
        set1(&*db, "f", &okey!("keep"), b"1");
        set1(&*db, "f", &okey!("drop"), b"2");
        let filter: Box<dyn Fn(&[u8]) -> bool + Send> =
            Box::new(|key| key == okey!("keep").as_slice());
        let got: Vec<_> = scan_after(&*db, "f", DBTime(0), Some(filter)).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].val, b"1");
    }

    #[test]
    fn test_scan_after_tolerates_double_set_in_batch() {
        let db = mem();
        let mut b = db.batch();
        set(&*db, &mut *b, "dbl", &okey!("k"), b"first");
        set(&*db, &mut *b, "dbl", &okey!("k"), b"second");
        b.apply();
        // Two index rows exist; only the newer one yields the entry.
        let got: Vec<_> = scan_after(&*db, "dbl", DBTime(0), None).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].val, b"second");
    }

    #[test]
    fn test_scan_after_tolerates_set_then_delete_in_batch() {
        let db = mem();
        let mut b = db.batch();
        set(&*db, &mut *b, "sd", &okey!("k"), b"v");
        // The delete cannot see the uncommitted primary row, so the
        // index row it would remove stays behind.
        b.apply();
        let mut b = db.batch();
        set(&*db, &mut *b, "sd", &okey!("k"), b"v2");
        delete(&*db, &mut *b, "sd", &okey!("k"));
        b.apply();
        let got: Vec<_> = scan_after(&*db, "sd", DBTime(0), None).collect();
        assert!(got.is_empty());
    }

    #[test]
    fn test_watcher_incremental() {
        let db = mem();
        let w = Watcher::new(db.clone(), "test", "wk", |e: &Entry| e.val.clone());
        for name in ["d1", "d2", "d3"] {
            set1(&*db, "wk", &okey!(name), name.as_bytes());
        }

        // First iteration: mark through d2, then break.
        {
            let mut it = w.recent();
            let first = it.next().unwrap();
            assert_eq!(first, b"d1");
            let second = it.next().unwrap();
            assert_eq!(second, b"d2");
            let t2 = get(&*db, "wk", &okey!("d2")).unwrap().mod_time;
            it.mark_old(t2);
        }

        set1(&*db, "wk", &okey!("d4"), b"d4");

        // Second iteration: exactly {d3, d4}.
        let got: Vec<_> = w.recent().collect();
        assert_eq!(got, vec![b"d3".to_vec(), b"d4".to_vec()]);
    }

    #[test]
    fn test_watcher_mark_old_takes_max() {
        let db = mem();
        let w = Watcher::new(db.clone(), "max", "wm", |e: &Entry| e.mod_time);
        let t1 = set1(&*db, "wm", &okey!("a"), b"");
        let t2 = set1(&*db, "wm", &okey!("b"), b"");
        {
            let mut it = w.recent();
            while it.next().is_some() {}
            it.mark_old(t2);
            it.mark_old(t1); // older value: no-op
        }
        assert!(w.recent().next().is_none());
    }

    #[test]
    fn test_watcher_restart() {
        let db = mem();
        let w = Watcher::new(db.clone(), "rs", "wr", |e: &Entry| e.val.clone());
        set1(&*db, "wr", &okey!("a"), b"a");
        set1(&*db, "wr", &okey!("b"), b"b");
        {
            let mut it = w.recent();
            while it.next().is_some() {}
            let t = get(&*db, "wr", &okey!("b")).unwrap().mod_time;
            it.mark_old(t);
        }
        assert!(w.recent().next().is_none());
        w.restart();
        let got: Vec<_> = w.recent().collect();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_watcher_shared_cursor_across_instances() {
        let db = mem();
        let t1 = set1(&*db, "sh", &okey!("a"), b"a");
        set1(&*db, "sh", &okey!("b"), b"b");
        {
            let w = Watcher::new(db.clone(), "name", "sh", |e: &Entry| e.val.clone());
            let mut it = w.recent();
            it.next();
            it.mark_old(t1);
        }
        // A different watcher instance with the same name resumes.
        let w2 = Watcher::new(db.clone(), "name", "sh", |e: &Entry| e.val.clone());
        let got: Vec<_> = w2.recent().collect();
        assert_eq!(got, vec![b"b".to_vec()]);
    }

    #[test]
    #[should_panic(expected = "already locked")]
    fn test_watcher_nested_iteration_panics() {
        let db = mem();
        let w = Watcher::new(db.clone(), "nest", "wn", |e: &Entry| e.val.clone());
        let _outer = w.recent();
        let _inner = w.recent();
    }
}
