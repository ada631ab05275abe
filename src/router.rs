//! Request routing and dispatch.
//!
//! Dispatch runs in two phases: static-mount prefix matching first
//! (linear over mounts ordered by descending prefix length), then the
//! route table — exact method/path, parameterised patterns, and finally
//! the `*` method and path fallbacks. Matched requests run through the
//! priority-sorted middleware chain into the handler.
//!
//! The route and mount tables are append-only: registration needs
//! `&mut Router`, serving works on `Arc<Router>`.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::{router::Router, Method};
//!
//! let mut router = Router::new();
//! router.route(Method::GET, "/", || async { "hello" });
//! router.route(Method::GET, "/users/{id}", || async { "user" });
//! router.middleware(|req, next| async move {
//!     tracing::debug!(path = %req.uri().path(), "request");
//!     next.run(req).await
//! });
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use dashmap::DashMap;
use http::StatusCode;
use hyper::Method;
use parking_lot::RwLock;

use crate::{
    body::CatBody,
    extractors::params::PathParams,
    handler::{BoxHandler, Handler},
    middleware::{DEFAULT_PRIORITY, Next},
    plugins::EnginePlugin,
    responder::Responder,
    route::{MethodPattern, Route},
    state::set_state,
    static_files::StaticMount,
    types::{BoxMiddleware, Request, Response},
};

/// Router owning the route table, static mounts, and middleware chain.
pub struct Router {
    /// Exact-match index plus scan set, keyed by (method key, pattern).
    routes: DashMap<(String, String), Arc<Route>>,
    /// Static mounts, kept sorted by descending prefix length.
    mounts: RwLock<Vec<Arc<StaticMount>>>,
    /// Global middleware with priorities.
    middlewares: RwLock<Vec<(i32, BoxMiddleware)>>,
    /// Registered plugins.
    plugins: Vec<Box<dyn EnginePlugin>>,
    /// Ensures plugin setup runs once.
    plugins_initialized: AtomicBool,
}

impl Router {
    /// An empty router.
    pub fn new() -> Self {
        Self {
            routes: DashMap::default(),
            mounts: RwLock::new(Vec::new()),
            middlewares: RwLock::new(Vec::new()),
            plugins: Vec::new(),
            plugins_initialized: AtomicBool::new(false),
        }
    }

    /// Registers a route for one method. The path may contain `{param}`
    /// segments or be the catch-all `*`.
    pub fn route<H, T>(&mut self, method: Method, path: &str, handler: H) -> Arc<Route>
    where
        H: Handler<T> + Clone,
        T: 'static,
    {
        self.add_route(MethodPattern::Exact(method), path, handler)
    }

    /// Registers a route answering every method.
    pub fn route_any_method<H, T>(&mut self, path: &str, handler: H) -> Arc<Route>
    where
        H: Handler<T> + Clone,
        T: 'static,
    {
        self.add_route(MethodPattern::Any, path, handler)
    }

    fn add_route<H, T>(&mut self, method: MethodPattern, path: &str, handler: H) -> Arc<Route>
    where
        H: Handler<T> + Clone,
        T: 'static,
    {
        let route = Arc::new(Route::new(
            path.to_string(),
            method.clone(),
            BoxHandler::new(handler),
        ));
        self.routes
            .insert((method.key(), path.to_owned()), route.clone());
        route
    }

    /// Mounts a static directory. Longer prefixes win over shorter ones
    /// regardless of registration order.
    pub fn mount(&mut self, mount: StaticMount) {
        let mut mounts = self.mounts.write();
        mounts.push(Arc::new(mount));
        mounts.sort_by_key(|m| std::cmp::Reverse(m.prefix().len()));
    }

    /// Stores a value in the string-keyed DI context.
    pub fn state<T: Clone + Send + Sync + 'static>(&mut self, key: &str, value: T) {
        set_state(key, value);
    }

    /// Adds global middleware at the default priority.
    pub fn middleware<F, Fut, R>(&self, f: F) -> &Self
    where
        F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Responder + Send + 'static,
    {
        self.middleware_with_priority(DEFAULT_PRIORITY, f)
    }

    /// Adds global middleware with an explicit priority (lower runs
    /// earlier).
    pub fn middleware_with_priority<F, Fut, R>(&self, priority: i32, f: F) -> &Self
    where
        F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Responder + Send + 'static,
    {
        let mw: BoxMiddleware = Arc::new(move |req, next| {
            let fut = f(req, next);
            Box::pin(async move { fut.await.into_response() })
        });
        self.middlewares.write().push((priority, mw));
        self
    }

    /// Registers a plugin; its `setup` runs once at server start.
    pub fn plugin<P>(&mut self, plugin: P) -> &mut Self
    where
        P: EnginePlugin + Clone + Send + Sync + 'static,
    {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Snapshot of the registered mounts, for the server's upkeep tasks.
    pub(crate) fn mounts(&self) -> Vec<Arc<StaticMount>> {
        self.mounts.read().clone()
    }

    pub(crate) fn setup_plugins_once(&self) {
        use std::sync::atomic::Ordering;

        if !self.plugins_initialized.swap(true, Ordering::SeqCst) {
            for plugin in &self.plugins {
                if let Err(err) = plugin.setup(self) {
                    tracing::warn!(plugin = plugin.name(), error = %err, "plugin setup failed");
                }
            }
        }
    }

    /// Dispatches one request: mounts first, then routes, then 404.
    pub async fn dispatch(&self, mut req: Request) -> Response {
        let path = req.uri().path().to_owned();

        // Static mounts take precedence for read methods; everything
        // else falls through to the route table.
        if matches!(*req.method(), Method::GET | Method::HEAD) {
            let matched = {
                let mounts = self.mounts.read();
                mounts.iter().find(|m| m.matches(&path)).cloned()
            };
            if let Some(mount) = matched {
                return mount.serve(req).await;
            }
        }

        if let Some(route) = self.find_route(req.method(), &path) {
            if let Some(params) = route.match_path(&path) {
                if !params.is_empty() {
                    req.extensions_mut().insert(PathParams(params));
                }
                return self.run_chain(route, req).await;
            }
        }

        hyper::Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(CatBody::empty())
            .unwrap_or_else(|_| StatusCode::NOT_FOUND.into_response())
    }

    /// Route table scan order: exact literal, parameterised with exact
    /// method, any-method patterns, catch-all path.
    fn find_route(&self, method: &Method, path: &str) -> Option<Arc<Route>> {
        if let Some(route) = self.routes.get(&(method.to_string(), path.to_owned())) {
            return Some(route.clone());
        }

        let mut any_method: Option<Arc<Route>> = None;
        let mut catch_all: Option<Arc<Route>> = None;
        for entry in self.routes.iter() {
            let route = entry.value();
            if !route.method.matches(method) {
                continue;
            }
            if route.path == "*" {
                // Weakest match; only used when nothing else hits.
                if catch_all.is_none()
                    || (matches!(route.method, MethodPattern::Exact(_))
                        && matches!(
                            catch_all.as_ref().map(|r| &r.method),
                            Some(MethodPattern::Any)
                        ))
                {
                    catch_all = Some(route.clone());
                }
                continue;
            }
            if route.match_path(path).is_some() {
                match route.method {
                    MethodPattern::Exact(_) => return Some(route.clone()),
                    MethodPattern::Any => {
                        if any_method.is_none() {
                            any_method = Some(route.clone());
                        }
                    }
                }
            }
        }
        any_method.or(catch_all)
    }

    /// Builds the merged, priority-sorted chain and runs it.
    async fn run_chain(&self, route: Arc<Route>, req: Request) -> Response {
        let mut chain: Vec<(i32, BoxMiddleware)> = self.middlewares.read().clone();
        chain.extend(route.middlewares.read().iter().cloned());
        // Stable: global middleware precedes route middleware on ties.
        chain.sort_by_key(|(priority, _)| *priority);

        let next = Next {
            middlewares: Arc::new(chain.into_iter().map(|(_, mw)| mw).collect()),
            endpoint: Arc::new(route.handler.clone()),
        };
        next.run(req).await
    }

    /// Merges another router's routes and mounts into this one. The other
    /// router's global middleware becomes route-level middleware on the
    /// merged routes.
    pub fn merge(&mut self, other: Router) {
        let other_mws = other.middlewares.read().clone();
        for entry in other.routes.iter() {
            let (key, route) = entry.pair();
            for (priority, mw) in other_mws.iter().rev() {
                route.middlewares.write().insert(0, (*priority, mw.clone()));
            }
            self.routes.insert(key.clone(), route.clone());
        }
        let mut mounts = self.mounts.write();
        mounts.extend(other.mounts.read().iter().cloned());
        mounts.sort_by_key(|m| std::cmp::Reverse(m.prefix().len()));
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
