#![cfg_attr(docsrs, feature(doc_cfg))]

//! An embeddable HTTP/1.1 request-serving engine.
//!
//! Catzilla couples asynchronous network and filesystem I/O with a typed
//! arena allocator, a hot in-memory content cache, a lock-free priority
//! task engine, and a streaming multipart upload pipeline. A host program
//! registers routes and static mounts on a [`router::Router`], hands the
//! listener to [`serve`], and produces responses from native handlers or
//! callbacks into the host.
//!
//! # High-level features
//! - HTTP/1.1 serving on tokio + hyper with keep-alive and pipelining
//! - Static mounts with traversal/extension/symlink policy, ETags,
//!   conditional requests, range responses, and a byte-budgeted LRU hot
//!   cache with TTL sweep
//! - Typed arenas: five allocation domains with chunk recycling, stats,
//!   and cross-domain free detection
//! - Background task engine: four lock-free priority bands, delayed and
//!   retryable tasks, auto-scaling worker threads
//! - Streaming multipart uploads: size-class buffer pool, watermark
//!   backpressure, spill-to-disk, optional virus-scan hand-off
//! - Virus scanning via a clamd socket or a spawned `clamscan` binary
//!   behind one verdict interface
//! - Priority-ordered middleware with staged responses, plus a token
//!   bucket rate-limit plugin
//!
//! # Quickstart
//!
//! ```rust,no_run
//! use catzilla::{Method, router::Router, static_files::StaticMount};
//! use tokio::net::TcpListener;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut router = Router::new();
//! router.route(Method::GET, "/health", || async { "ok" });
//! router.mount(StaticMount::builder("/static", "./web").build());
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! catzilla::serve(listener, router).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//! - `jemalloc` — use jemalloc as the global allocator
//! - `telemetry` — structured tracing subscriber bootstrap

/// Typed arena allocator with per-domain bookkeeping.
pub mod arena;

/// Response body wrapper over hyper's body machinery.
pub mod body;

/// Hot in-memory content cache with LRU eviction and TTL sweep.
pub mod cache;

/// Virus-scan adapter: clamd socket and clamscan process backends.
pub mod clamav;

/// Server configuration surface.
pub mod config;

/// Background task engine and worker pool.
pub mod engine;

/// Engine error taxonomy and HTTP mapping.
pub mod error;

/// Typed request data extraction.
pub mod extractors;

/// Streaming file responses and range assembly.
pub mod file_stream;

/// Handler traits and the type-erased handler wrapper.
mod handler;

/// Middleware chain execution.
pub mod middleware;

/// Streaming multipart upload pipeline.
pub mod multipart;

/// Platform compatibility primitives.
pub mod platform;

/// Plugin registration.
pub mod plugins;

/// Lock-free multi-producer multi-consumer queues.
pub mod queue;

/// Conversion of handler return values into responses.
pub mod responder;

/// Route definition and path pattern matching.
pub mod route;

/// Request routing and dispatch.
pub mod router;

/// Accept loop and connection lifecycle.
mod server;

/// String-keyed dependency-injection context.
pub mod state;

/// Static file serving with policy enforcement.
pub mod static_files;

/// Tracing subscriber bootstrap.
#[cfg(feature = "telemetry")]
#[cfg_attr(docsrs, doc(cfg(feature = "telemetry")))]
pub mod tracing;

/// Core type aliases.
pub mod types;

pub use bytes::Bytes;
pub use http::{Method, StatusCode, header};
pub use http_body_util::Full;

pub use server::{serve, serve_with_shutdown};

/// Global memory allocator using jemalloc.
#[cfg(feature = "jemalloc")]
#[cfg_attr(docsrs, doc(cfg(feature = "jemalloc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;
