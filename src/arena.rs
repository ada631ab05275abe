//! Typed arena allocator with per-domain bookkeeping and chunk recycling.
//!
//! Every hot-path allocation in the engine is tagged with the domain it
//! belongs to: request parsing, response assembly, cache content, static
//! file buffers, or worker scratch. A buffer handle carries its
//! [`ArenaKind`] so that returning memory to the wrong domain is caught in
//! debug builds and counted in release builds instead of silently skewing
//! the books. Freed chunks are pooled by size class and handed back on the
//! next allocation of a compatible size, which is where the cache hit/miss
//! counters come from.
//!
//! No lock is held across an allocation: pools are popped and pushed under
//! a short `parking_lot` mutex, while the actual heap work happens outside
//! it. With the `jemalloc` feature the global allocator underneath is
//! jemalloc, exactly as in release deployments; the bookkeeping here is
//! identical either way.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::arena::{ArenaKind, Arenas};
//!
//! let arenas = Arenas::new();
//! let mut buf = arenas.alloc(ArenaKind::Request, 256).unwrap();
//! buf.extend_from_slice(b"GET / HTTP/1.1");
//! assert_eq!(&buf[..], b"GET / HTTP/1.1");
//! drop(buf); // chunk returns to the request arena pool
//! assert_eq!(arenas.stats().allocations, 1);
//! assert_eq!(arenas.stats().deallocations, 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::platform::counter_add;

/// Allocation domains. Ids are stable and wire-visible in stats output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ArenaKind {
    /// Short-lived per-connection request storage.
    Request = 0,
    /// Short-lived per-response assembly buffers.
    Response = 1,
    /// Long-lived shared cache content.
    Cache = 2,
    /// Long-lived static file read buffers.
    Static = 3,
    /// Background worker scratch space.
    Task = 4,
}

impl ArenaKind {
    /// All domains in id order.
    pub const ALL: [ArenaKind; 5] = [
        ArenaKind::Request,
        ArenaKind::Response,
        ArenaKind::Cache,
        ArenaKind::Static,
        ArenaKind::Task,
    ];

    /// Stable numeric id.
    #[inline]
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Human-readable domain name for stats and logs.
    pub fn name(self) -> &'static str {
        match self {
            ArenaKind::Request => "request",
            ArenaKind::Response => "response",
            ArenaKind::Cache => "cache",
            ArenaKind::Static => "static",
            ArenaKind::Task => "task",
        }
    }
}

/// Size classes chunks are rounded up to before pooling.
const SIZE_CLASSES: [usize; 5] = [512, 4 * 1024, 8 * 1024, 64 * 1024, 1024 * 1024];

/// Pooled chunks retained per size class before excess is released to the
/// allocator.
const MAX_POOLED_PER_CLASS: usize = 64;

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| size <= c)
}

fn class_capacity(size: usize) -> usize {
    class_index(size)
        .map(|i| SIZE_CLASSES[i])
        .unwrap_or(size)
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    peak_bytes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cross_arena_frees: AtomicU64,
    bytes_in_use: [AtomicU64; 5],
}

impl Counters {
    fn total_in_use(&self) -> u64 {
        self.bytes_in_use
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    fn note_alloc(&self, kind: ArenaKind, bytes: u64) {
        counter_add(&self.allocations, 1);
        self.bytes_in_use[kind.id() as usize].fetch_add(bytes, Ordering::Relaxed);
        let total = self.total_in_use();
        self.peak_bytes.fetch_max(total, Ordering::Relaxed);
    }

    fn note_free(&self, kind: ArenaKind, bytes: u64) {
        counter_add(&self.deallocations, 1);
        self.bytes_in_use[kind.id() as usize].fetch_sub(bytes, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.deallocations.store(0, Ordering::Relaxed);
        self.peak_bytes.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.cross_arena_frees.store(0, Ordering::Relaxed);
        for b in &self.bytes_in_use {
            b.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time snapshot of the process-wide allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Buffers handed out since init or the last reset.
    pub allocations: u64,
    /// Buffers returned.
    pub deallocations: u64,
    /// Highest total bytes-in-use observed across all arenas.
    pub peak_bytes: u64,
    /// Current bytes-in-use per arena, indexed by [`ArenaKind::id`].
    pub bytes_in_use: [u64; 5],
    /// Allocations satisfied from the chunk pool.
    pub cache_hits: u64,
    /// Allocations that had to touch the heap.
    pub cache_misses: u64,
    /// Explicit frees presented to the wrong arena (release-mode count;
    /// debug builds assert instead).
    pub cross_arena_frees: u64,
}

struct ArenaInner {
    kind: ArenaKind,
    pools: [Mutex<Vec<Vec<u8>>>; 5],
    counters: Arc<Counters>,
}

impl ArenaInner {
    fn new(kind: ArenaKind, counters: Arc<Counters>) -> Self {
        Self {
            kind,
            pools: Default::default(),
            counters,
        }
    }

    /// Pops a pooled chunk for `size`, or allocates a fresh one. Returns
    /// `None` only when the heap refuses the reservation.
    fn take_chunk(&self, size: usize) -> Option<Vec<u8>> {
        let cap = class_capacity(size);
        if let Some(idx) = class_index(size) {
            let pooled = self.pools[idx].lock().pop();
            if let Some(mut chunk) = pooled {
                counter_add(&self.counters.cache_hits, 1);
                chunk.clear();
                return Some(chunk);
            }
        }
        counter_add(&self.counters.cache_misses, 1);
        let mut chunk = Vec::new();
        chunk.try_reserve_exact(cap).ok()?;
        Some(chunk)
    }

    fn recycle(&self, chunk: Vec<u8>) {
        if let Some(idx) = class_index(chunk.capacity())
            && SIZE_CLASSES[idx] == chunk.capacity()
        {
            let mut pool = self.pools[idx].lock();
            if pool.len() < MAX_POOLED_PER_CLASS {
                pool.push(chunk);
                return;
            }
        }
        // Off-class or pool full: let the allocator have it back.
        drop(chunk);
    }

    fn purge(&self) {
        for pool in &self.pools {
            pool.lock().clear();
        }
    }
}

/// Owned buffer tagged with the arena it came from.
///
/// Dropping the buffer returns its chunk to the originating arena; the
/// explicit [`Arenas::free`] entry point exists for call sites that want
/// the domain checked.
pub struct ArenaBuf {
    data: Vec<u8>,
    /// Capacity currently reflected in the bytes-in-use counters; kept in
    /// step when the underlying chunk grows.
    accounted: usize,
    origin: Arc<ArenaInner>,
}

impl ArenaBuf {
    /// The domain this buffer belongs to.
    #[inline]
    pub fn kind(&self) -> ArenaKind {
        self.origin.kind
    }

    /// Current length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes have been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Usable capacity without growing.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Appends bytes, growing within the same arena when needed.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.reconcile();
    }

    /// Truncates to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Resizes to `len` bytes, zero-filling growth. Read paths size the
    /// buffer first and fill it in place.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
        self.reconcile();
    }

    /// Folds a silent capacity change into the domain counters.
    fn reconcile(&mut self) {
        let cap = self.data.capacity();
        if cap == self.accounted {
            return;
        }
        let counters = &self.origin.counters;
        let cell = &counters.bytes_in_use[self.origin.kind.id() as usize];
        if cap > self.accounted {
            cell.fetch_add((cap - self.accounted) as u64, Ordering::Relaxed);
            counters
                .peak_bytes
                .fetch_max(counters.total_in_use(), Ordering::Relaxed);
        } else {
            cell.fetch_sub((self.accounted - cap) as u64, Ordering::Relaxed);
        }
        self.accounted = cap;
    }

    /// Consumes the buffer into refcounted [`bytes::Bytes`].
    ///
    /// The chunk leaves the arena permanently; bytes-in-use accounting is
    /// settled as a free at the moment of conversion.
    pub fn freeze(mut self) -> bytes::Bytes {
        self.reconcile();
        let data = std::mem::take(&mut self.data);
        self.origin
            .counters
            .note_free(self.origin.kind, self.accounted as u64);
        self.accounted = 0;
        bytes::Bytes::from(data)
    }
}

impl Deref for ArenaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ArenaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        let chunk = std::mem::take(&mut self.data);
        if chunk.capacity() == 0 {
            // Already settled by freeze().
            return;
        }
        self.origin
            .counters
            .note_free(self.origin.kind, self.accounted as u64);
        self.origin.recycle(chunk);
    }
}

impl std::fmt::Debug for ArenaBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaBuf")
            .field("kind", &self.kind().name())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// The five process-wide allocation domains plus their shared statistics.
pub struct Arenas {
    arenas: [Arc<ArenaInner>; 5],
    counters: Arc<Counters>,
}

static GLOBAL: OnceCell<Arenas> = OnceCell::new();

impl Arenas {
    /// Builds an independent arena set. Servers normally share
    /// [`Arenas::global`]; tests build their own.
    pub fn new() -> Self {
        let counters = Arc::new(Counters::default());
        let arenas = ArenaKind::ALL
            .map(|kind| Arc::new(ArenaInner::new(kind, counters.clone())));
        Self { arenas, counters }
    }

    /// Process-wide arena set. First call initialises; later calls return
    /// the same instance.
    pub fn global() -> &'static Arenas {
        GLOBAL.get_or_init(Arenas::new)
    }

    /// Allocates `size` bytes of capacity from `kind`.
    ///
    /// Returns `None` when the underlying allocator reports exhaustion;
    /// the engine maps that to a resource error rather than aborting.
    pub fn alloc(&self, kind: ArenaKind, size: usize) -> Option<ArenaBuf> {
        let inner = &self.arenas[kind.id() as usize];
        let chunk = inner.take_chunk(size)?;
        self.counters.note_alloc(kind, chunk.capacity() as u64);
        Some(ArenaBuf {
            accounted: chunk.capacity(),
            data: chunk,
            origin: inner.clone(),
        })
    }

    /// Grows `buf` to at least `new_size` capacity within its own arena.
    ///
    /// Growth stays accounted to the buffer's domain. Returns `false` when
    /// the heap refuses the reservation, leaving `buf` untouched.
    pub fn realloc(&self, buf: &mut ArenaBuf, new_size: usize) -> bool {
        if new_size <= buf.data.capacity() {
            return true;
        }
        let additional = class_capacity(new_size) - buf.data.len();
        if buf.data.try_reserve_exact(additional).is_err() {
            return false;
        }
        buf.reconcile();
        true
    }

    /// Returns `buf` to `kind`, checking the domain.
    ///
    /// A mismatched domain is a programming error: debug builds assert,
    /// release builds count it and still return the chunk to its true
    /// origin so the books stay right.
    pub fn free(&self, kind: ArenaKind, buf: ArenaBuf) {
        debug_assert_eq!(
            kind,
            buf.kind(),
            "buffer allocated from {} freed against {}",
            buf.kind().name(),
            kind.name(),
        );
        if kind != buf.kind() {
            counter_add(&self.counters.cross_arena_frees, 1);
            tracing::warn!(
                allocated = buf.kind().name(),
                freed_against = kind.name(),
                "cross-arena free",
            );
        }
        drop(buf);
    }

    /// Drops pooled free chunks for `kind`, returning memory to the OS at
    /// the allocator's discretion. Advisory.
    pub fn purge(&self, kind: ArenaKind) {
        self.arenas[kind.id() as usize].purge();
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> AllocStats {
        let c = &self.counters;
        AllocStats {
            allocations: c.allocations.load(Ordering::Relaxed),
            deallocations: c.deallocations.load(Ordering::Relaxed),
            peak_bytes: c.peak_bytes.load(Ordering::Relaxed),
            bytes_in_use: [
                c.bytes_in_use[0].load(Ordering::Relaxed),
                c.bytes_in_use[1].load(Ordering::Relaxed),
                c.bytes_in_use[2].load(Ordering::Relaxed),
                c.bytes_in_use[3].load(Ordering::Relaxed),
                c.bytes_in_use[4].load(Ordering::Relaxed),
            ],
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            cross_arena_frees: c.cross_arena_frees.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter. Arena descriptors and pooled chunks remain.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}

impl Default for Arenas {
    fn default() -> Self {
        Self::new()
    }
}
