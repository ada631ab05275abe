//! `Range` header parsing for partial content requests.
//!
//! Single-range `bytes=` specifiers only, in the three RFC 9110 forms:
//! `bytes=0-499`, `bytes=500-` and `bytes=-500`. Multipart ranges are not
//! served; a multi-range header is treated as unsatisfiable. The static
//! file pipeline resolves the parsed spec against the entity length and
//! answers 416 when resolution fails.

use http::HeaderMap;
use http::StatusCode;
use http::request::Parts;

use crate::extractors::FromRequest;
use crate::extractors::FromRequestParts;
use crate::responder::Responder;
use crate::types::Request;

/// One parsed `Range` specifier, not yet resolved against a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedRange {
    /// `bytes=start-end` (inclusive) or `bytes=start-` when `end` is None.
    FromStart { start: u64, end: Option<u64> },
    /// `bytes=-len`: the final `len` bytes of the entity.
    Suffix { len: u64 },
}

/// Failure modes for `Range` parsing. Malformed headers map to 416.
#[derive(Debug)]
pub enum RangeError {
    /// Not a `bytes=` specifier, or empty/multi-range.
    InvalidFormat,
    /// Numeric bounds failed to parse.
    ParseError,
}

impl Responder for RangeError {
    fn into_response(self) -> crate::types::Response {
        match self {
            RangeError::InvalidFormat => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                "invalid Range format; expected bytes=start-end",
            )
                .into_response(),
            RangeError::ParseError => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                "invalid numeric bounds in Range",
            )
                .into_response(),
        }
    }
}

impl RequestedRange {
    /// Parses the `Range` header if present.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, RangeError> {
        let value = match headers.get(http::header::RANGE) {
            Some(v) => v.to_str().map_err(|_| RangeError::InvalidFormat)?,
            None => return Ok(None),
        };

        let spec = value
            .strip_prefix("bytes=")
            .ok_or(RangeError::InvalidFormat)?
            .trim();
        if spec.is_empty() || spec.contains(',') {
            return Err(RangeError::InvalidFormat);
        }

        let (start_str, end_str) = spec.split_once('-').ok_or(RangeError::InvalidFormat)?;

        if start_str.is_empty() {
            let len = end_str.parse::<u64>().map_err(|_| RangeError::ParseError)?;
            return Ok(Some(RequestedRange::Suffix { len }));
        }

        let start = start_str.parse::<u64>().map_err(|_| RangeError::ParseError)?;
        let end = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().map_err(|_| RangeError::ParseError)?)
        };

        Ok(Some(RequestedRange::FromStart { start, end }))
    }

    /// Resolves against an entity of `total` bytes into inclusive
    /// `(start, end)` offsets. `None` means unsatisfiable.
    pub fn resolve(self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        match self {
            RequestedRange::FromStart { start, end } => {
                if start >= total {
                    return None;
                }
                let end = end.map(|e| e.min(total - 1)).unwrap_or(total - 1);
                if start > end {
                    return None;
                }
                Some((start, end))
            }
            RequestedRange::Suffix { len } => {
                if len == 0 {
                    return None;
                }
                let start = total.saturating_sub(len);
                Some((start, total - 1))
            }
        }
    }
}

impl<'a> FromRequest<'a> for Option<RequestedRange> {
    type Error = RangeError;

    fn from_request(
        req: &'a mut Request,
    ) -> impl core::future::Future<Output = Result<Self, Self::Error>> + Send + 'a {
        futures_util::future::ready(RequestedRange::from_headers(req.headers()))
    }
}

impl<'a> FromRequestParts<'a> for Option<RequestedRange> {
    type Error = RangeError;

    fn from_request_parts(
        parts: &'a mut Parts,
    ) -> impl core::future::Future<Output = Result<Self, Self::Error>> + Send + 'a {
        futures_util::future::ready(RequestedRange::from_headers(&parts.headers))
    }
}
