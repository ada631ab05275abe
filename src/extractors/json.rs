//! JSON request body extraction.
//!
//! `Json<T>` validates the `Content-Type`, collects the body, and
//! deserializes it with serde. Handlers that ask for the parsed JSON root
//! get it through this extractor; everything else leaves the body alone.
//!
//! # Examples
//!
//! ```rust,no_run
//! use catzilla::extractors::json::Json;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct CreateNote {
//!     title: String,
//!     body: String,
//! }
//!
//! async fn create_note(Json(note): Json<CreateNote>) -> String {
//!     format!("created {}", note.title)
//! }
//! ```

use http::StatusCode;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::{
    extractors::{ContentKind, FromRequest},
    responder::Responder,
    types::Request,
};

/// Deserialized JSON request body.
pub struct Json<T>(pub T);

/// Failure modes for JSON extraction. All map to 400.
#[derive(Debug)]
pub enum JsonError {
    /// `Content-Type` is not a JSON type.
    InvalidContentType,
    /// Body could not be read off the connection.
    BodyReadError(String),
    /// Syntactically or structurally invalid JSON.
    DeserializationError(String),
}

impl Responder for JsonError {
    fn into_response(self) -> crate::types::Response {
        match self {
            JsonError::InvalidContentType => (
                StatusCode::BAD_REQUEST,
                "invalid content type; expected application/json",
            )
                .into_response(),
            JsonError::BodyReadError(err) => {
                (StatusCode::BAD_REQUEST, format!("failed to read body: {err}")).into_response()
            }
            JsonError::DeserializationError(err) => {
                (StatusCode::BAD_REQUEST, format!("invalid JSON: {err}")).into_response()
            }
        }
    }
}

impl<'a, T> FromRequest<'a> for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Error = JsonError;

    fn from_request(
        req: &'a mut Request,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a
    {
        async move {
            if ContentKind::of(req.headers()) != ContentKind::Json {
                return Err(JsonError::InvalidContentType);
            }

            let body_bytes = req
                .body_mut()
                .collect()
                .await
                .map_err(|e| JsonError::BodyReadError(e.to_string()))?
                .to_bytes();

            let data = serde_json::from_slice(&body_bytes)
                .map_err(|e| JsonError::DeserializationError(e.to_string()))?;

            Ok(Json(data))
        }
    }
}
