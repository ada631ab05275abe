//! Engine error taxonomy and its mapping onto HTTP responses.
//!
//! Errors are grouped by kind rather than by producing module: input and
//! policy failures map to client responses where they arise, resource and
//! I/O failures at request scope surface as a short generic 500, and
//! internal invariant violations are logged and tear down only the
//! offending connection. The task engine never goes through this type —
//! task failures travel through the failure continuation instead.

use std::io;

use http::StatusCode;

use crate::responder::Responder;
use crate::types::Response;

/// Central error type for the serving engine.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed request data: bad syntax, oversized header, unsupported
    /// content type.
    Input(String),
    /// Request denied by configuration: forbidden path, blocked
    /// extension, size over limit.
    Policy(PolicyDenial),
    /// Out of memory, descriptor exhaustion, saturated queue.
    Resource(String),
    /// Filesystem or network failure.
    Io(io::Error),
    /// A collaborator outside the engine failed (scan daemon and the
    /// like).
    External(String),
    /// Broken invariant. Debug builds should never reach the `Responder`
    /// path with one of these.
    Internal(String),
}

/// Policy rejections carry the status they map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDenial {
    /// Path traversal, hidden file, blocked extension, symlink.
    Forbidden,
    /// No such file below the mount root.
    NotFound,
    /// Entity larger than the configured limit.
    TooLarge,
    /// Range outside the entity.
    RangeNotSatisfiable,
}

impl EngineError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::Input(_) => StatusCode::BAD_REQUEST,
            EngineError::Policy(PolicyDenial::Forbidden) => StatusCode::FORBIDDEN,
            EngineError::Policy(PolicyDenial::NotFound) => StatusCode::NOT_FOUND,
            EngineError::Policy(PolicyDenial::TooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            EngineError::Policy(PolicyDenial::RangeNotSatisfiable) => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            EngineError::Io(e) if e.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            EngineError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                StatusCode::FORBIDDEN
            }
            EngineError::Resource(_)
            | EngineError::Io(_)
            | EngineError::External(_)
            | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Input(msg) => write!(f, "bad request: {msg}"),
            EngineError::Policy(denial) => write!(f, "policy rejection: {denial:?}"),
            EngineError::Resource(msg) => write!(f, "resource exhausted: {msg}"),
            EngineError::Io(e) => write!(f, "i/o error: {e}"),
            EngineError::External(msg) => write!(f, "external failure: {msg}"),
            EngineError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl Responder for EngineError {
    /// Client-caused kinds keep their message; server-side kinds send a
    /// short generic body and log the detail instead.
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            EngineError::Input(msg) => (status, msg.clone()).into_response(),
            EngineError::Policy(_) => {
                (status, status.canonical_reason().unwrap_or("rejected")).into_response()
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (status, "internal server error").into_response()
            }
        }
    }
}

/// Engine-internal result alias.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            EngineError::Input("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::Policy(PolicyDenial::Forbidden).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            EngineError::Policy(PolicyDenial::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::Policy(PolicyDenial::TooLarge).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            EngineError::Policy(PolicyDenial::RangeNotSatisfiable).status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            EngineError::Resource("oom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn io_kind_refines_status() {
        let not_found = EngineError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let denied = EngineError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let reset = EngineError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert_eq!(reset.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn server_side_errors_stay_generic() {
        let resp = EngineError::Internal("lru corrupt".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
