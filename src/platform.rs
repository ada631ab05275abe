//! Platform compatibility primitives shared by the concurrent subsystems.
//!
//! This module is the single point of truth for the low-level contracts the
//! rest of the engine relies on: a non-decreasing nanosecond clock, the
//! memory orderings used by every atomic hot path, and small path/socket
//! helpers. Nothing in here may block; synchronisation lives with the data
//! structures that need it.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::platform::{now_ns, DIR_SEPARATOR};
//!
//! let a = now_ns();
//! let b = now_ns();
//! assert!(b >= a);
//! assert!(DIR_SEPARATOR == '/' || DIR_SEPARATOR == '\\');
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

/// Directory separator for the current platform.
pub const DIR_SEPARATOR: char = std::path::MAIN_SEPARATOR;

/// Process-wide anchor for the monotonic clock.
static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Returns monotonic nanoseconds since an arbitrary process-local anchor.
///
/// Non-decreasing for the lifetime of the process. Values are only
/// meaningful relative to each other, never across processes.
#[inline]
pub fn now_ns() -> u64 {
    CLOCK_ANCHOR.elapsed().as_nanos() as u64
}

/// Returns monotonic milliseconds since the process anchor.
#[inline]
pub fn now_ms() -> u64 {
    now_ns() / 1_000_000
}

/// Acquire-load of a 64-bit atomic.
///
/// Paired with [`store_release`]: a load that observes a released store also
/// observes every write that happened before that store.
#[inline]
pub fn load_acquire(a: &AtomicU64) -> u64 {
    a.load(Ordering::Acquire)
}

/// Release-store of a 64-bit atomic.
#[inline]
pub fn store_release(a: &AtomicU64, v: u64) {
    a.store(v, Ordering::Release);
}

/// Relaxed fetch-add for pure counters where only the total matters.
#[inline]
pub fn counter_add(a: &AtomicU64, v: u64) -> u64 {
    a.fetch_add(v, Ordering::Relaxed)
}

/// Compare-and-swap with release on success and acquire on failure.
///
/// Returns `Ok(previous)` on success, `Err(actual)` when the value changed
/// underneath the caller.
#[inline]
pub fn cas_u64(a: &AtomicU64, current: u64, new: u64) -> Result<u64, u64> {
    a.compare_exchange(current, new, Ordering::Release, Ordering::Acquire)
}

/// Compare-and-swap over raw pointers, same ordering contract as [`cas_u64`].
#[inline]
pub fn cas_ptr<T>(
    a: &AtomicPtr<T>,
    current: *mut T,
    new: *mut T,
) -> Result<*mut T, *mut T> {
    a.compare_exchange(current, new, Ordering::Release, Ordering::Acquire)
}

/// Formats a socket address as `ip:port`, collapsing the unspecified
/// address to `*`.
pub fn format_addr(addr: &SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("*:{}", addr.port())
    } else {
        addr.to_string()
    }
}

/// Extracts the client IP from an optional peer address, falling back to
/// the unspecified IPv4 address when the transport did not supply one.
pub fn peer_ip(addr: Option<&SocketAddr>) -> std::net::IpAddr {
    addr.map(|a| a.ip())
        .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn clock_is_monotonic() {
        let mut last = now_ns();
        for _ in 0..1_000 {
            let next = now_ns();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn cas_reports_actual_on_conflict() {
        let a = AtomicU64::new(7);
        assert_eq!(cas_u64(&a, 7, 8), Ok(7));
        assert_eq!(cas_u64(&a, 7, 9), Err(8));
        assert_eq!(load_acquire(&a), 8);
    }

    #[test]
    fn unspecified_addr_formats_as_star() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(format_addr(&addr), "*:8080");
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(format_addr(&addr), "127.0.0.1:9000");
    }

    #[test]
    fn peer_ip_falls_back_to_unspecified() {
        assert!(peer_ip(None).is_unspecified());
        let addr: SocketAddr = "10.1.2.3:1".parse().unwrap();
        assert_eq!(peer_ip(Some(&addr)).to_string(), "10.1.2.3");
    }
}
