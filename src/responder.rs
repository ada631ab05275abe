//! Conversion of handler return values into HTTP responses.
//!
//! The [`Responder`] trait is the seam between handlers (native or host
//! callbacks) and the wire: anything a handler returns is converted into a
//! `Response` here. Error enums across the crate implement `Responder` so
//! the middleware chain can treat an extraction or policy failure as a
//! staged response.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::responder::Responder;
//! use http::StatusCode;
//!
//! let ok = "fine".into_response();
//! assert_eq!(ok.status(), StatusCode::OK);
//!
//! let teapot = (StatusCode::IM_A_TEAPOT, "short and stout").into_response();
//! assert_eq!(teapot.status(), StatusCode::IM_A_TEAPOT);
//! ```

use std::{convert::Infallible, fmt::Display};

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::Full;

use crate::body::CatBody;

/// Converts a value into an HTTP response.
pub trait Responder {
    fn into_response(self) -> Response<CatBody>;
}

impl Responder for Response<CatBody> {
    fn into_response(self) -> Response<CatBody> {
        self
    }
}

impl Responder for &'static str {
    fn into_response(self) -> Response<CatBody> {
        Response::new(CatBody::new(Full::from(Bytes::from_static(
            self.as_bytes(),
        ))))
    }
}

impl Responder for String {
    fn into_response(self) -> Response<CatBody> {
        Response::new(CatBody::new(Full::from(Bytes::from(self))))
    }
}

impl Responder for Bytes {
    fn into_response(self) -> Response<CatBody> {
        Response::new(CatBody::new(Full::from(self)))
    }
}

impl Responder for () {
    fn into_response(self) -> Response<CatBody> {
        Response::new(CatBody::empty())
    }
}

impl Responder for Infallible {
    fn into_response(self) -> Response<CatBody> {
        match self {}
    }
}

impl Responder for StatusCode {
    fn into_response(self) -> Response<CatBody> {
        let mut res = Response::new(CatBody::empty());
        *res.status_mut() = self;
        res
    }
}

/// Static header name/value pairs attached without heap allocation.
pub struct StaticHeaders<const N: usize>(pub [(HeaderName, &'static str); N]);

impl<const N: usize> Responder for (StatusCode, StaticHeaders<N>) {
    fn into_response(self) -> Response<CatBody> {
        let (status, StaticHeaders(headers)) = self;
        let mut res = Response::new(CatBody::empty());
        *res.status_mut() = status;

        for (name, value) in headers {
            res.headers_mut()
                .append(name, HeaderValue::from_static(value));
        }
        res
    }
}

impl<R> Responder for (StatusCode, R)
where
    R: Display,
{
    fn into_response(self) -> Response<CatBody> {
        let (status, body) = self;
        let mut res = Response::new(CatBody::new(Full::from(Bytes::from(body.to_string()))));
        *res.status_mut() = status;
        res
    }
}

impl Responder for CatBody {
    fn into_response(self) -> Response<CatBody> {
        Response::new(self)
    }
}

/// Untyped failures surface as a generic 500; the detail goes to the log,
/// not the wire.
impl Responder for anyhow::Error {
    fn into_response(self) -> Response<CatBody> {
        tracing::error!(error = %self, "handler failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
    }
}

impl<T, E> Responder for Result<T, E>
where
    T: Responder,
    E: Responder,
{
    fn into_response(self) -> Response<CatBody> {
        match self {
            Ok(value) => value.into_response(),
            Err(err) => err.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_and_string_are_200() {
        assert_eq!("x".into_response().status(), StatusCode::OK);
        assert_eq!(String::from("y").into_response().status(), StatusCode::OK);
    }

    #[test]
    fn status_tuple_carries_status() {
        let res = (StatusCode::NOT_FOUND, "missing").into_response();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn static_headers_are_appended() {
        let res = (
            StatusCode::OK,
            StaticHeaders([
                (HeaderName::from_static("x-content-type-options"), "nosniff"),
                (HeaderName::from_static("x-frame-options"), "DENY"),
            ]),
        )
            .into_response();
        assert_eq!(res.headers()["x-content-type-options"], "nosniff");
        assert_eq!(res.headers()["x-frame-options"], "DENY");
    }

    #[test]
    fn result_picks_the_right_arm() {
        let ok: Result<&'static str, StatusCode> = Ok("fine");
        assert_eq!(ok.into_response().status(), StatusCode::OK);
        let err: Result<&'static str, StatusCode> = Err(StatusCode::FORBIDDEN);
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }
}
