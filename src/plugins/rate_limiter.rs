//! Token-bucket rate limiting keyed by client IP.
//!
//! Each client IP owns a bucket holding up to `max_requests` tokens; a
//! request spends one token and is answered 429 when the bucket is dry.
//! A background task replenishes tokens at `max_requests / window` per
//! second and retires buckets idle for five minutes, so the map stays
//! bounded by the set of recently active clients.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::plugins::rate_limiter::RateLimiterBuilder;
//! use catzilla::router::Router;
//!
//! let limiter = RateLimiterBuilder::new()
//!     .max_requests(120)
//!     .window_seconds(60)
//!     .build();
//!
//! let mut router = Router::new();
//! router.plugin(limiter);
//! ```

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use dashmap::DashMap;
use http::StatusCode;
use tokio::time;

use crate::{
    body::CatBody, middleware::Next, platform::peer_ip, plugins::EnginePlugin,
    responder::Responder, router::Router, types::Request,
};

/// Rate limiter parameters.
#[derive(Clone)]
pub struct Config {
    /// Requests allowed per window; also the burst capacity.
    pub max_requests: u32,
    /// Window the allowance is spread over.
    pub window: Duration,
    /// Status returned on a dry bucket.
    pub status_on_limit: StatusCode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            status_on_limit: StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Fluent construction of a [`RateLimiterPlugin`].
pub struct RateLimiterBuilder(Config);

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self(Config::default())
    }

    /// Allowance (and burst capacity) per window.
    pub fn max_requests(mut self, n: u32) -> Self {
        self.0.max_requests = n;
        self
    }

    /// Window length in seconds; clamped to at least one second.
    pub fn window_seconds(mut self, s: u64) -> Self {
        self.0.window = Duration::from_secs(s.max(1));
        self
    }

    /// Status returned when the limit is exceeded.
    pub fn status(mut self, st: StatusCode) -> Self {
        self.0.status_on_limit = st;
        self
    }

    pub fn build(self) -> RateLimiterPlugin {
        RateLimiterPlugin {
            cfg: self.0,
            store: Arc::new(DashMap::new()),
        }
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct Bucket {
    tokens: f64,
    last_seen: Instant,
}

/// The rate limiting plugin. Cloning shares the bucket store.
#[derive(Clone)]
pub struct RateLimiterPlugin {
    cfg: Config,
    store: Arc<DashMap<IpAddr, Bucket>>,
}

impl EnginePlugin for RateLimiterPlugin {
    fn name(&self) -> &'static str {
        "rate-limiter"
    }

    fn setup(&self, router: &Router) -> Result<()> {
        let cfg = self.cfg.clone();
        let store = self.store.clone();

        // Runs early so limited requests skip the rest of the chain.
        router.middleware_with_priority(0, move |req, next| {
            let cfg = cfg.clone();
            let store = store.clone();
            async move { enforce(req, next, cfg, store).await }
        });

        let cfg = self.cfg.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut tick = time::interval(Duration::from_secs(1));
            let add_per_tick = cfg.max_requests as f64 / cfg.window.as_secs_f64();
            let purge_after = Duration::from_secs(300);
            loop {
                tick.tick().await;
                let now = Instant::now();
                store.retain(|_, b| {
                    b.tokens = (b.tokens + add_per_tick).min(cfg.max_requests as f64);
                    now.duration_since(b.last_seen) < purge_after
                });
            }
        });

        Ok(())
    }
}

async fn enforce(
    req: Request,
    next: Next,
    cfg: Config,
    store: Arc<DashMap<IpAddr, Bucket>>,
) -> impl Responder {
    let ip = peer_ip(req.extensions().get::<SocketAddr>());

    let mut entry = store.entry(ip).or_insert_with(|| Bucket {
        tokens: cfg.max_requests as f64,
        last_seen: Instant::now(),
    });

    if entry.tokens < 1.0 {
        tracing::debug!(%ip, "rate limit exceeded");
        return hyper::Response::builder()
            .status(cfg.status_on_limit)
            .body(CatBody::empty())
            .unwrap_or_else(|_| cfg.status_on_limit.into_response());
    }
    entry.tokens -= 1.0;
    entry.last_seen = Instant::now();
    drop(entry);

    next.run(req).await
}
