//! Middleware chain execution.
//!
//! Middleware run in priority order (lower first), before and after the
//! handler: code before `next.run(..)` is the pre-route side, code after
//! it is the post-route side. The flow outcomes map onto ordinary control
//! flow rather than a verdict enum:
//!
//! - *continue*: call `next.run(req)` and return its response;
//! - *skip-route* / *stop*: return a response (often the staged one)
//!   without calling `next`;
//! - *error*: return an error value whose `Responder` impl maps it.
//!
//! A middleware must not retain the request or context past its return;
//! ownership of the request moves down the chain and the response moves
//! back up.
//!
//! # Examples
//!
//! ```rust,no_run
//! use catzilla::{middleware::Next, types::{Request, Response}};
//!
//! async fn timing(req: Request, next: Next) -> Response {
//!     let start = std::time::Instant::now();
//!     let response = next.run(req).await;
//!     tracing::debug!(elapsed = ?start.elapsed(), "request finished");
//!     response
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};

use crate::{
    body::CatBody,
    handler::BoxHandler,
    responder::Responder,
    types::{BoxMiddleware, Request, Response},
};

/// Default priority for middleware registered without one. Lower runs
/// earlier.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Staged response a middleware prepares for a later stop/skip decision.
///
/// Carried in request extensions so pre-route middleware can hand a
/// prepared response to whatever middleware decides to send it.
#[derive(Debug, Clone)]
pub struct StagedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    content_type: Option<HeaderValue>,
    body: Bytes,
}

/// Upper bound on staged headers.
const MAX_STAGED_HEADERS: usize = 32;

impl StagedResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            content_type: None,
            body: Bytes::new(),
        }
    }

    /// Adds a header. Headers past the cap of 32 are dropped.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if self.headers.len() < MAX_STAGED_HEADERS {
            self.headers.push((name, value));
        }
        self
    }

    pub fn content_type(mut self, value: HeaderValue) -> Self {
        self.content_type = Some(value);
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Stages this response on the request for a later chain decision.
    pub fn stage(self, req: &mut Request) {
        req.extensions_mut().insert(self);
    }

    /// Takes a previously staged response off the request.
    pub fn take(req: &mut Request) -> Option<StagedResponse> {
        req.extensions_mut().remove::<StagedResponse>()
    }
}

impl Responder for StagedResponse {
    fn into_response(self) -> Response {
        let mut res = hyper::Response::builder().status(self.status);
        if let Some(ct) = self.content_type {
            res = res.header(http::header::CONTENT_TYPE, ct);
        }
        let mut res = res
            .body(CatBody::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        for (name, value) in self.headers {
            res.headers_mut().append(name, value);
        }
        res
    }
}

/// The remainder of the middleware chain plus the terminal handler.
pub struct Next {
    /// Remaining middleware, already priority-sorted by the router.
    pub middlewares: Arc<Vec<BoxMiddleware>>,
    /// Handler called once the chain is exhausted.
    pub endpoint: Arc<BoxHandler>,
}

impl Next {
    /// Runs the next middleware, or the handler when none remain.
    pub async fn run(self, req: Request) -> Response {
        if let Some((mw, rest)) = self.middlewares.split_first() {
            let rest = Arc::new(rest.to_vec());
            mw(
                req,
                Next {
                    middlewares: rest,
                    endpoint: self.endpoint.clone(),
                },
            )
            .await
        } else {
            self.endpoint.call(req).await
        }
    }
}
