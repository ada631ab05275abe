//! Typed extraction of request data.
//!
//! Extractors are the lazy parsed views of a request: nothing is parsed
//! until a handler asks for it. [`FromRequest`] covers extractors that may
//! consume the body (JSON, forms); [`FromRequestParts`] covers
//! metadata-only extractors that compose freely. Extraction errors
//! implement [`Responder`](crate::responder::Responder) and short-circuit
//! the handler with the mapped HTTP response.

use http::request::Parts;

/// Form data (application/x-www-form-urlencoded) parsing.
pub mod form;

/// HTTP header map access.
pub mod header_map;

/// JSON request body deserialization.
pub mod json;

/// Path parameter extraction from dynamic route segments.
pub mod params;

/// Query string deserialization.
pub mod query;

/// `Range` header parsing for partial content requests.
pub mod range;

/// Coarse body classification derived from `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// No body or an unrecognised type.
    None,
    /// `application/json` and `application/*+json`.
    Json,
    /// `application/x-www-form-urlencoded`.
    Form,
    /// `multipart/form-data`.
    Multipart,
}

impl ContentKind {
    /// Classifies a request by its `Content-Type` header.
    pub fn of(headers: &http::HeaderMap) -> ContentKind {
        let Some(ct) = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return ContentKind::None;
        };
        let Ok(mime) = ct.parse::<mime::Mime>() else {
            return ContentKind::None;
        };
        if mime.type_() == mime::APPLICATION {
            if mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON) {
                return ContentKind::Json;
            }
            if mime.subtype() == mime::WWW_FORM_URLENCODED {
                return ContentKind::Form;
            }
        }
        if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA {
            return ContentKind::Multipart;
        }
        ContentKind::None
    }
}

/// Extracts a type from a complete request, body included.
pub trait FromRequest<'a>: Sized {
    /// Error type returned when extraction fails.
    type Error: crate::responder::Responder;

    /// Extracts the type from the HTTP request.
    fn from_request(
        req: &'a mut crate::types::Request,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a;
}

/// Extracts a type from request metadata only. Body stays untouched, so
/// several of these can run against one request.
pub trait FromRequestParts<'a>: Sized {
    /// Error type returned when extraction fails.
    type Error: crate::responder::Responder;

    /// Extracts the type from the HTTP request parts.
    fn from_request_parts(
        parts: &'a mut Parts,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a;
}

// Borrow the whole request in handlers: `async fn h(req: &mut Request, ...)`.
impl<'a> FromRequest<'a> for &'a mut crate::types::Request {
    type Error = core::convert::Infallible;

    fn from_request(
        req: &'a mut crate::types::Request,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a
    {
        std::future::ready(Ok(req))
    }
}
