//! URL-encoded form body extraction.
//!
//! `Form<T>` handles `application/x-www-form-urlencoded` bodies, the
//! second of the lazily parsed body views next to JSON.

use http::StatusCode;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::{
    extractors::{ContentKind, FromRequest},
    responder::Responder,
    types::Request,
};

/// Deserialized form body.
pub struct Form<T>(pub T);

/// Failure modes for form extraction. All map to 400.
#[derive(Debug)]
pub enum FormError {
    /// `Content-Type` is not `application/x-www-form-urlencoded`.
    InvalidContentType,
    /// Body could not be read off the connection.
    BodyReadError(String),
    /// Parameters did not deserialize into the target type.
    DeserializationError(String),
}

impl Responder for FormError {
    fn into_response(self) -> crate::types::Response {
        match self {
            FormError::InvalidContentType => (
                StatusCode::BAD_REQUEST,
                "invalid content type; expected application/x-www-form-urlencoded",
            )
                .into_response(),
            FormError::BodyReadError(err) => {
                (StatusCode::BAD_REQUEST, format!("failed to read body: {err}")).into_response()
            }
            FormError::DeserializationError(err) => {
                (StatusCode::BAD_REQUEST, format!("invalid form data: {err}")).into_response()
            }
        }
    }
}

impl<'a, T> FromRequest<'a> for Form<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Error = FormError;

    fn from_request(
        req: &'a mut Request,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a
    {
        async move {
            if ContentKind::of(req.headers()) != ContentKind::Form {
                return Err(FormError::InvalidContentType);
            }

            let body_bytes = req
                .body_mut()
                .collect()
                .await
                .map_err(|e| FormError::BodyReadError(e.to_string()))?
                .to_bytes();

            let data = serde_urlencoded::from_bytes(&body_bytes)
                .map_err(|e| FormError::DeserializationError(e.to_string()))?;

            Ok(Form(data))
        }
    }
}
