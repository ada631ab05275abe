//! Core type aliases shared across the engine.
//!
//! These aliases pin down the request/response shapes used everywhere:
//! requests carry hyper's streaming `Incoming` body so large uploads are
//! consumed incrementally, responses carry [`CatBody`]. `BoxMiddleware` is
//! the erased middleware function type the chain executes.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;

use crate::{body::CatBody, middleware::Next};

/// Incoming HTTP request with a streaming body.
pub type Request = hyper::Request<Incoming>;

/// Outgoing HTTP response.
pub type Response = hyper::Response<CatBody>;

/// Erased response body.
pub(crate) type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Thread-safe erased error.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Erased middleware function: receives the request and the rest of the
/// chain, produces the response.
pub type BoxMiddleware = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;
