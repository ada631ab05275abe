//! Response body wrapper over hyper's body machinery.
//!
//! [`CatBody`] erases the concrete body behind one type so responses can
//! carry static bytes, arena-frozen content, or a file stream through the
//! same `Response` alias. Conversions exist for the common cases; the
//! stream constructors are what the static file pipeline uses for range
//! responses.
//!
//! # Examples
//!
//! ```rust
//! use catzilla::body::CatBody;
//! use bytes::Bytes;
//!
//! let empty = CatBody::empty();
//! let text = CatBody::from("hello");
//! let raw = CatBody::from(Bytes::from_static(b"\x00\x01"));
//! ```

use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;

use anyhow::Result;
use futures_util::{Stream, TryStream, TryStreamExt};
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, SizeHint};

use crate::types::{BoxBody, BoxError};

/// Unified response body.
pub struct CatBody(BoxBody);

impl CatBody {
    /// Wraps any body implementation.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(|e| e.into()).boxed_unsync())
    }

    /// Streams `Result<Bytes, E>` items as body data.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + Debug + 'static,
    {
        let stream = stream.map_err(Into::into).map_ok(hyper::body::Frame::data);
        let body = StreamBody::new(stream).boxed_unsync();
        Self(body)
    }

    /// Streams pre-built frames; used by the file streaming path.
    pub fn from_try_stream<S, E>(stream: S) -> Self
    where
        S: TryStream<Ok = Frame<Bytes>, Error = E> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let body = StreamBody::new(stream.map_err(Into::into)).boxed_unsync();
        Self(body)
    }

    /// A body that immediately signals end-of-stream. For HEAD, 204, 304.
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for CatBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<()> for CatBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<&str> for CatBody {
    fn from(buf: &str) -> Self {
        let owned = buf.to_owned();
        Self::new(http_body_util::Full::from(owned))
    }
}

macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for CatBody {
            fn from(buf: $ty) -> Self {
                Self::new(http_body_util::Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl Body for CatBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}
