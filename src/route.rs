//! Route definition and path pattern matching.
//!
//! A route pairs a method pattern (a literal method or `*`) with a path
//! pattern (literal, parameterised `{name}` segments, or the catch-all
//! `*`). The table is append-only: routes are registered during startup
//! and only read while serving.

use std::collections::HashMap;

use http::Method;
use parking_lot::RwLock;

use crate::{
    handler::BoxHandler,
    middleware::{DEFAULT_PRIORITY, Next},
    responder::Responder,
    types::{BoxMiddleware, Request},
};

/// Method side of a route: one method or any.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodPattern {
    /// Matches exactly one method.
    Exact(Method),
    /// `*`: matches every method.
    Any,
}

impl MethodPattern {
    /// Whether `method` satisfies this pattern.
    #[inline]
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodPattern::Exact(m) => m == method,
            MethodPattern::Any => true,
        }
    }

    /// Stable key string used by the route table.
    pub fn key(&self) -> String {
        match self {
            MethodPattern::Exact(m) => m.to_string(),
            MethodPattern::Any => "*".to_string(),
        }
    }
}

impl From<Method> for MethodPattern {
    fn from(m: Method) -> Self {
        MethodPattern::Exact(m)
    }
}

/// One registered route.
pub struct Route {
    /// Path pattern this route was registered with.
    pub path: String,
    /// Method pattern this route answers.
    pub method: MethodPattern,
    /// Handler invoked on a match.
    pub handler: BoxHandler,
    /// Route-level middleware with priorities; merged with the global
    /// chain at dispatch.
    pub(crate) middlewares: RwLock<Vec<(i32, BoxMiddleware)>>,
}

impl Route {
    pub(crate) fn new(path: String, method: MethodPattern, handler: BoxHandler) -> Self {
        Self {
            path,
            method,
            handler,
            middlewares: RwLock::new(Vec::new()),
        }
    }

    /// True when the pattern contains no parameters or wildcards, so the
    /// route is reachable through the exact-match index alone.
    pub(crate) fn is_literal(&self) -> bool {
        self.path != "*" && !self.path.contains('{')
    }

    /// Matches `path` against the pattern, returning captured parameters.
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        if self.path == "*" {
            return Some(HashMap::new());
        }
        if self.is_literal() {
            // Trailing slashes are not significant for literal routes.
            let matched = self.path.trim_end_matches('/') == path.trim_end_matches('/');
            return matched.then(HashMap::new);
        }

        let mut params = HashMap::new();
        let pattern_segs = self.path.trim_matches('/').split('/');
        let mut path_segs = path.trim_matches('/').split('/');

        for pattern_seg in pattern_segs {
            let path_seg = path_segs.next()?;
            if let Some(name) = pattern_seg
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
            {
                if path_seg.is_empty() {
                    return None;
                }
                params.insert(name.to_string(), path_seg.to_string());
            } else if pattern_seg != path_seg {
                return None;
            }
        }
        if path_segs.next().is_some() {
            return None;
        }
        Some(params)
    }

    /// Adds middleware at the default priority to this route only.
    pub fn middleware<F, Fut, R>(&self, f: F) -> &Self
    where
        F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Responder + Send + 'static,
    {
        self.middleware_with_priority(DEFAULT_PRIORITY, f)
    }

    /// Adds middleware with an explicit priority (lower runs earlier).
    pub fn middleware_with_priority<F, Fut, R>(&self, priority: i32, f: F) -> &Self
    where
        F: Fn(Request, Next) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Responder + Send + 'static,
    {
        let mw: BoxMiddleware = std::sync::Arc::new(move |req, next| {
            let fut = f(req, next);
            Box::pin(async move { fut.await.into_response() })
        });
        self.middlewares.write().push((priority, mw));
        self
    }
}
