//! Query string extraction.

use std::future::ready;

use http::{StatusCode, request::Parts};
use serde::de::DeserializeOwned;

use crate::{
    extractors::{FromRequest, FromRequestParts},
    responder::Responder,
    types::Request,
};

/// Deserialized query parameters.
pub struct Query<T>(pub T);

/// Failure modes for query extraction. All map to 400.
#[derive(Debug)]
pub enum QueryError {
    /// Parameters did not deserialize into the target type.
    DeserializationError(String),
}

impl Responder for QueryError {
    fn into_response(self) -> crate::types::Response {
        match self {
            QueryError::DeserializationError(err) => (
                StatusCode::BAD_REQUEST,
                format!("invalid query parameters: {err}"),
            )
                .into_response(),
        }
    }
}

impl<T> Query<T>
where
    T: DeserializeOwned,
{
    fn parse(query: Option<&str>) -> Result<Query<T>, QueryError> {
        serde_urlencoded::from_str(query.unwrap_or_default())
            .map(Query)
            .map_err(|e| QueryError::DeserializationError(e.to_string()))
    }
}

impl<'a, T> FromRequest<'a> for Query<T>
where
    T: DeserializeOwned + Send + 'a,
{
    type Error = QueryError;

    fn from_request(
        req: &'a mut Request,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a
    {
        ready(Self::parse(req.uri().query()))
    }
}

impl<'a, T> FromRequestParts<'a> for Query<T>
where
    T: DeserializeOwned + Send + 'a,
{
    type Error = QueryError;

    fn from_request_parts(
        parts: &'a mut Parts,
    ) -> impl core::future::Future<Output = core::result::Result<Self, Self::Error>> + Send + 'a
    {
        ready(Self::parse(parts.uri.query()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Paging {
        page: u32,
        limit: Option<u32>,
    }

    #[test]
    fn parses_typed_parameters() {
        let q: Query<Paging> = Query::parse(Some("page=3&limit=20")).unwrap();
        assert_eq!(q.0.page, 3);
        assert_eq!(q.0.limit, Some(20));
    }

    #[test]
    fn missing_optional_fields_are_none() {
        let q: Query<Paging> = Query::parse(Some("page=1")).unwrap();
        assert_eq!(q.0.limit, None);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert!(Query::<Paging>::parse(None).is_err());
    }
}
