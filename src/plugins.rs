//! Plugin registration for cross-cutting server features.
//!
//! A plugin packages middleware plus any background upkeep it needs (the
//! rate limiter's replenish task, for example). Plugins register on the
//! router and are set up exactly once when the server starts.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::plugins::EnginePlugin;
//! use catzilla::router::Router;
//! use anyhow::Result;
//!
//! #[derive(Clone)]
//! struct RequestLog;
//!
//! impl EnginePlugin for RequestLog {
//!     fn name(&self) -> &'static str {
//!         "request-log"
//!     }
//!
//!     fn setup(&self, router: &Router) -> Result<()> {
//!         router.middleware(|req, next| async move {
//!             tracing::info!(method = %req.method(), path = %req.uri().path(), "request");
//!             next.run(req).await
//!         });
//!         Ok(())
//!     }
//! }
//!
//! let mut router = Router::new();
//! router.plugin(RequestLog);
//! ```

use anyhow::Result;

use crate::router::Router;

/// Token-bucket rate limiting keyed by client IP.
pub mod rate_limiter;

/// A server extension set up once at startup.
pub trait EnginePlugin: Send + Sync + 'static {
    /// Unique plugin name, used in logs.
    fn name(&self) -> &'static str;

    /// Installs the plugin's middleware and background work.
    fn setup(&self, router: &Router) -> Result<()>;
}
