//! Hot in-memory cache for static file content.
//!
//! A hash index over normalised relative paths combined with an intrusive
//! LRU list, bounded by a byte budget. Entry bytes are refcounted
//! [`Bytes`]: eviction drops the cache's reference while readers that
//! already hold a view keep theirs, so reclaim never races a reader.
//!
//! Reads are biased: `get` takes only the read lock, bumps the entry's
//! atomic access stamp, and records the touch in a side queue; the actual
//! LRU repositioning is deferred to the next write-locked operation
//! (`put`, `invalidate`, `sweep`). Replacement retires the old entry in
//! place — entry bytes are immutable after insertion.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::cache::HotCache;
//! use bytes::Bytes;
//! use std::time::SystemTime;
//!
//! let cache = HotCache::new(1024 * 1024, std::time::Duration::from_secs(60));
//! cache.put("index.html", Bytes::from_static(b"hello\n"), 0xfeed, SystemTime::now());
//! let view = cache.get("index.html").unwrap();
//! assert_eq!(&view.bytes[..], b"hello\n");
//! assert_eq!(cache.stats().hits, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::platform::{counter_add, now_ns};

const NIL: usize = usize::MAX;

struct Entry {
    key: Box<str>,
    bytes: Bytes,
    size: u64,
    etag: u64,
    modified: SystemTime,
    inserted_ns: u64,
    last_access_ns: AtomicU64,
    access_count: AtomicU64,
    /// LRU linkage; `NIL` at the ends.
    prev: usize,
    next: usize,
}

/// Read-only view of a cache entry. Holding the view keeps the bytes
/// alive across a concurrent eviction.
#[derive(Debug, Clone)]
pub struct CacheView {
    pub bytes: Bytes,
    pub etag: u64,
    pub modified: SystemTime,
    /// Times this entry has been served, including this access.
    pub access_count: u64,
}

/// Cache counters. `used_bytes`/`entries` are current values, the rest
/// monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub replacements: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub used_bytes: u64,
    pub entries: u64,
}

struct Inner {
    map: AHashMap<Box<str>, usize>,
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    /// Most recently used.
    lru_head: usize,
    /// Least recently used; eviction starts here.
    lru_tail: usize,
    used_bytes: u64,
}

impl Inner {
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.slots[idx].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            NIL => self.lru_head = next,
            p => self.slots[p].as_mut().unwrap().next = next,
        }
        match next {
            NIL => self.lru_tail = prev,
            n => self.slots[n].as_mut().unwrap().prev = prev,
        }
        let e = self.slots[idx].as_mut().unwrap();
        e.prev = NIL;
        e.next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.lru_head;
        {
            let e = self.slots[idx].as_mut().unwrap();
            e.prev = NIL;
            e.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().unwrap().prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NIL {
            self.lru_tail = idx;
        }
    }

    fn remove(&mut self, idx: usize) -> Entry {
        self.detach(idx);
        let entry = self.slots[idx].take().unwrap();
        self.map.remove(&entry.key);
        self.free.push(idx);
        self.used_bytes -= entry.size;
        entry
    }

    fn insert_slot(&mut self, entry: Entry) -> usize {
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(entry);
                i
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        let key = self.slots[idx].as_ref().unwrap().key.clone();
        self.used_bytes += self.slots[idx].as_ref().unwrap().size;
        self.map.insert(key, idx);
        self.push_front(idx);
        idx
    }
}

/// Byte-budgeted LRU cache with a soft TTL sweep.
pub struct HotCache {
    inner: RwLock<Inner>,
    /// Reads noted here are folded into the LRU order by the next writer.
    touched: Mutex<SmallVec<[usize; 32]>>,
    budget: u64,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    replacements: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl HotCache {
    /// A cache holding at most `budget` bytes of content; entries
    /// untouched for `ttl` are dropped by [`HotCache::sweep`].
    pub fn new(budget: u64, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: AHashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                lru_head: NIL,
                lru_tail: NIL,
                used_bytes: 0,
            }),
            touched: Mutex::new(SmallVec::new()),
            budget,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Looks up `path`, recording the access. The returned view stays
    /// valid after eviction or replacement.
    pub fn get(&self, path: &str) -> Option<CacheView> {
        let inner = self.inner.read();
        match inner.map.get(path) {
            Some(&idx) => {
                let entry = inner.slots[idx].as_ref()?;
                entry.last_access_ns.store(now_ns(), Ordering::Relaxed);
                let count = entry.access_count.fetch_add(1, Ordering::Relaxed) + 1;
                let view = CacheView {
                    bytes: entry.bytes.clone(),
                    etag: entry.etag,
                    modified: entry.modified,
                    access_count: count,
                };
                counter_add(&self.hits, 1);
                self.touched.lock().push(idx);
                Some(view)
            }
            None => {
                counter_add(&self.misses, 1);
                None
            }
        }
    }

    /// Inserts or replaces `path`. Returns `false` when the content alone
    /// exceeds the whole budget; otherwise the LRU tail is evicted until
    /// the entry fits. The later of two racing puts wins.
    pub fn put(&self, path: &str, bytes: Bytes, etag: u64, modified: SystemTime) -> bool {
        let size = bytes.len() as u64;
        if size > self.budget {
            return false;
        }
        let mut inner = self.inner.write();
        self.drain_touches(&mut inner);

        if let Some(&idx) = inner.map.get(path) {
            inner.remove(idx);
            counter_add(&self.replacements, 1);
        } else {
            counter_add(&self.insertions, 1);
        }

        while inner.used_bytes + size > self.budget {
            let tail = inner.lru_tail;
            debug_assert_ne!(tail, NIL, "budget underflow with empty LRU");
            if tail == NIL {
                break;
            }
            inner.remove(tail);
            counter_add(&self.evictions, 1);
        }

        let now = now_ns();
        inner.insert_slot(Entry {
            key: path.into(),
            bytes,
            size,
            etag,
            modified,
            inserted_ns: now,
            last_access_ns: AtomicU64::new(now),
            access_count: AtomicU64::new(0),
            prev: NIL,
            next: NIL,
        });
        true
    }

    /// Removes `path` if present.
    pub fn invalidate(&self, path: &str) -> bool {
        let mut inner = self.inner.write();
        self.drain_touches(&mut inner);
        if let Some(&idx) = inner.map.get(path) {
            inner.remove(idx);
            counter_add(&self.invalidations, 1);
            true
        } else {
            false
        }
    }

    /// Drops entries whose last access is older than the soft TTL.
    /// Intended to run periodically (the server ticks it every 60 s).
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.write();
        self.drain_touches(&mut inner);
        let cutoff = now_ns().saturating_sub(self.ttl.as_nanos() as u64);
        let mut expired = Vec::new();
        let mut idx = inner.lru_tail;
        while idx != NIL {
            let entry = inner.slots[idx].as_ref().unwrap();
            let idle_since = entry
                .last_access_ns
                .load(Ordering::Relaxed)
                .max(entry.inserted_ns);
            if idle_since < cutoff {
                expired.push(idx);
            }
            idx = entry.prev;
        }
        for idx in &expired {
            inner.remove(*idx);
            counter_add(&self.expirations, 1);
        }
        expired.len()
    }

    /// Empties the cache. Used at mount shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        self.touched.lock().clear();
        inner.map.clear();
        inner.slots.clear();
        inner.free.clear();
        inner.lru_head = NIL;
        inner.lru_tail = NIL;
        inner.used_bytes = 0;
    }

    /// Current content bytes resident.
    pub fn used_bytes(&self) -> u64 {
        self.inner.read().used_bytes
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// True when no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured byte budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            used_bytes: inner.used_bytes,
            entries: inner.map.len() as u64,
        }
    }

    /// Folds deferred read touches into the LRU order. Caller holds the
    /// write lock.
    fn drain_touches(&self, inner: &mut Inner) {
        let touched = std::mem::take(&mut *self.touched.lock());
        for idx in touched {
            // The touched slot may have been replaced or evicted since the
            // read; only reposition slots that are still linked.
            if inner.slots.get(idx).map(|s| s.is_some()).unwrap_or(false) {
                inner.detach(idx);
                inner.push_front(idx);
            }
        }
    }

    /// Verifies the bucket-index and LRU list describe the same entry
    /// set. Test support.
    #[cfg(test)]
    fn check_consistency(&self) {
        let inner = self.inner.read();
        let mut seen = 0usize;
        let mut bytes = 0u64;
        let mut idx = inner.lru_head;
        let mut prev = NIL;
        while idx != NIL {
            let entry = inner.slots[idx].as_ref().expect("LRU points at empty slot");
            assert_eq!(entry.prev, prev, "broken back-link at {}", &entry.key);
            assert_eq!(
                inner.map.get(&entry.key).copied(),
                Some(idx),
                "LRU entry missing from index",
            );
            seen += 1;
            bytes += entry.size;
            prev = idx;
            idx = entry.next;
        }
        assert_eq!(inner.lru_tail, prev);
        assert_eq!(seen, inner.map.len(), "index and LRU disagree on count");
        assert_eq!(bytes, inner.used_bytes, "byte accounting drifted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(cache: &HotCache, key: &str, content: &str) -> bool {
        cache.put(
            key,
            Bytes::copy_from_slice(content.as_bytes()),
            0xABCD,
            SystemTime::now(),
        )
    }

    #[test]
    fn hit_and_miss_counters() {
        let cache = HotCache::new(1024, Duration::from_secs(60));
        assert!(cache.get("missing").is_none());
        put(&cache, "a", "hello\n");
        let first = cache.get("a").unwrap();
        assert_eq!(&first.bytes[..], b"hello\n");
        assert_eq!(first.access_count, 1);
        let second = cache.get("a").unwrap();
        assert_eq!(second.access_count, 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        cache.check_consistency();
    }

    #[test]
    fn budget_is_never_exceeded() {
        let cache = HotCache::new(100, Duration::from_secs(60));
        for i in 0..50 {
            put(&cache, &format!("k{i}"), &"x".repeat(30));
            assert!(cache.used_bytes() <= 100, "budget exceeded at {i}");
            cache.check_consistency();
        }
        // 3 × 30 bytes fit, a fourth does not.
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn oversized_content_is_rejected() {
        let cache = HotCache::new(10, Duration::from_secs(60));
        assert!(!put(&cache, "big", &"y".repeat(11)));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().insertions, 0);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = HotCache::new(90, Duration::from_secs(60));
        put(&cache, "a", &"a".repeat(30));
        put(&cache, "b", &"b".repeat(30));
        put(&cache, "c", &"c".repeat(30));
        // Touch "a" so "b" is now the LRU tail.
        cache.get("a").unwrap();
        put(&cache, "d", &"d".repeat(30));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none(), "expected b evicted");
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        cache.check_consistency();
    }

    #[test]
    fn replacement_retires_old_bytes() {
        let cache = HotCache::new(1024, Duration::from_secs(60));
        put(&cache, "f", "version one");
        let old = cache.get("f").unwrap();
        put(&cache, "f", "v2");
        let new = cache.get("f").unwrap();
        // Reader keeps the retired bytes; the cache serves the new ones.
        assert_eq!(&old.bytes[..], b"version one");
        assert_eq!(&new.bytes[..], b"v2");
        assert_eq!(cache.used_bytes(), 2);
        assert_eq!(cache.stats().replacements, 1);
        cache.check_consistency();
    }

    #[test]
    fn view_survives_eviction() {
        let cache = HotCache::new(10, Duration::from_secs(60));
        put(&cache, "a", "0123456789");
        let view = cache.get("a").unwrap();
        put(&cache, "b", "9876543210"); // evicts "a"
        assert!(cache.get("a").is_none());
        assert_eq!(&view.bytes[..], b"0123456789");
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = HotCache::new(1024, Duration::from_secs(60));
        put(&cache, "gone", "bytes");
        assert!(cache.invalidate("gone"));
        assert!(!cache.invalidate("gone"));
        assert!(cache.get("gone").is_none());
        assert_eq!(cache.used_bytes(), 0);
        cache.check_consistency();
    }

    #[test]
    fn sweep_expires_idle_entries() {
        let cache = HotCache::new(1024, Duration::from_millis(20));
        put(&cache, "stale", "old");
        std::thread::sleep(Duration::from_millis(40));
        put(&cache, "fresh", "new");
        assert_eq!(cache.sweep(), 1);
        assert!(cache.get("stale").is_none());
        assert!(cache.get("fresh").is_some());
        assert_eq!(cache.stats().expirations, 1);
        cache.check_consistency();
    }

    #[test]
    fn sweep_keeps_recently_read_entries() {
        let cache = HotCache::new(1024, Duration::from_millis(50));
        put(&cache, "read", "kept");
        std::thread::sleep(Duration::from_millis(30));
        cache.get("read").unwrap(); // refreshes the access stamp
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.sweep(), 0);
        assert!(cache.get("read").is_some());
    }

    #[test]
    fn clear_resets_everything() {
        let cache = HotCache::new(1024, Duration::from_secs(60));
        put(&cache, "a", "1");
        put(&cache, "b", "2");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
        cache.check_consistency();
    }

    #[test]
    fn concurrent_reads_and_writes_stay_consistent() {
        use std::sync::Arc;
        let cache = Arc::new(HotCache::new(10_000, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("k{}", (t * 7 + i) % 40);
                    if i % 3 == 0 {
                        cache.put(
                            &key,
                            Bytes::from(vec![t as u8; 64]),
                            i as u64,
                            SystemTime::now(),
                        );
                    } else {
                        let _ = cache.get(&key);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.used_bytes() <= 10_000);
        // Fold outstanding touches, then verify the structure.
        cache.put("final", Bytes::from_static(b"x"), 0, SystemTime::now());
        cache.check_consistency();
    }
}
