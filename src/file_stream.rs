//! Streaming file responses and partial-content assembly.
//!
//! `FileStream` wraps a byte stream with the metadata needed to emit
//! correct download headers, and builds the 206 responses the static
//! pipeline serves for `Range` requests. Range bounds are resolved by the
//! caller ([`RequestedRange::resolve`](crate::extractors::range::RequestedRange::resolve));
//! this module seeks, limits, and streams — the descriptor is owned by the
//! stream and closed when the body finishes or the connection drops.

use std::{io::SeekFrom, path::Path};

use anyhow::Result;
use bytes::Bytes;
use futures_util::{TryStream, TryStreamExt};
use hyper::body::Frame;
use tokio::{
  fs::File,
  io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use crate::{
  body::CatBody,
  responder::Responder,
  types::{BoxError, Response},
};

/// A byte stream plus the metadata for file-download headers.
pub struct FileStream<S> {
  /// The underlying byte stream.
  pub stream: S,
  /// Optional filename for the Content-Disposition header.
  pub file_name: Option<String>,
  /// Optional size for the Content-Length header.
  pub content_size: Option<u64>,
}

impl<S> FileStream<S>
where
  S: TryStream + Send + 'static,
  S::Ok: Into<Bytes>,
  S::Error: Into<BoxError>,
{
  /// Creates a stream with the provided metadata.
  pub fn new(stream: S, file_name: Option<String>, content_size: Option<u64>) -> Self {
    Self {
      stream,
      file_name,
      content_size,
    }
  }

  /// Opens `path` and detects the metadata from the file itself.
  pub async fn from_path<P>(path: P) -> Result<FileStream<ReaderStream<File>>>
  where
    P: AsRef<Path>,
  {
    let file = File::open(&path).await?;
    let mut content_size = None;
    let mut file_name = None;

    if let Ok(metadata) = file.metadata().await {
      content_size = Some(metadata.len());
    }

    if let Some(os_name) = path.as_ref().file_name()
      && let Some(name) = os_name.to_str()
    {
      file_name = Some(name.to_owned());
    }

    Ok(FileStream {
      stream: ReaderStream::new(file),
      file_name,
      content_size,
    })
  }

  /// Builds a 206 Partial Content response for resolved inclusive byte
  /// offsets `start..=end` of an entity `total_size` bytes long.
  pub fn into_range_response(self, start: u64, end: u64, total_size: u64) -> Response {
    let mut response = hyper::Response::builder()
      .status(hyper::StatusCode::PARTIAL_CONTENT)
      .header(
        hyper::header::CONTENT_RANGE,
        format!("bytes {}-{}/{}", start, end, total_size),
      )
      .header(hyper::header::CONTENT_LENGTH, (end - start + 1).to_string())
      .header(hyper::header::ACCEPT_RANGES, "bytes");

    if let Some(ref name) = self.file_name {
      response = response.header(
        hyper::header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", name),
      );
    }

    let body = CatBody::from_try_stream(
      self
        .stream
        .map_ok(|chunk| Frame::data(Into::<Bytes>::into(chunk)))
        .map_err(Into::into),
    );

    response.body(body).unwrap_or_else(|e| {
      (
        hyper::StatusCode::INTERNAL_SERVER_ERROR,
        format!("range response error: {}", e),
      )
        .into_response()
    })
  }

  /// Opens `path`, seeks to `start`, and streams the inclusive range
  /// `start..=end` as a 206. Bounds must already be resolved against
  /// `total_size`.
  pub async fn range_response<P>(
    path: P,
    start: u64,
    end: u64,
    total_size: u64,
  ) -> Result<Response>
  where
    P: AsRef<Path>,
  {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let stream = ReaderStream::new(file.take(end - start + 1));
    Ok(FileStream::new(stream, None, None).into_range_response(start, end, total_size))
  }
}

impl<S> Responder for FileStream<S>
where
  S: TryStream + Send + 'static,
  S::Ok: Into<Bytes>,
  S::Error: Into<BoxError>,
{
  /// Full-entity 200 response with download headers.
  fn into_response(self) -> Response {
    let mut response = hyper::Response::builder().status(hyper::StatusCode::OK);

    if let Some(size) = self.content_size {
      response = response.header(hyper::header::CONTENT_LENGTH, size.to_string());
    }

    if let Some(ref name) = self.file_name {
      response = response.header(
        hyper::header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", name),
      );
    }

    let body = CatBody::from_try_stream(
      self
        .stream
        .map_ok(|chunk| Frame::data(Into::<Bytes>::into(chunk)))
        .map_err(Into::into),
    );

    response.body(body).unwrap_or_else(|e| {
      (
        hyper::StatusCode::INTERNAL_SERVER_ERROR,
        format!("file stream error: {}", e),
      )
        .into_response()
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http_body_util::BodyExt;

  #[tokio::test]
  async fn range_response_streams_exact_slice() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    tokio::fs::write(&path, b"0123456789").await.unwrap();

    let resp = FileStream::<ReaderStream<File>>::range_response(&path, 2, 5, 10)
      .await
      .unwrap();
    assert_eq!(resp.status(), hyper::StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.headers()[hyper::header::CONTENT_RANGE], "bytes 2-5/10");
    assert_eq!(resp.headers()[hyper::header::CONTENT_LENGTH], "4");
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"2345");
  }

  #[tokio::test]
  async fn from_path_detects_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("named.txt");
    tokio::fs::write(&path, b"hello").await.unwrap();

    let fs = FileStream::<ReaderStream<File>>::from_path(&path).await.unwrap();
    assert_eq!(fs.content_size, Some(5));
    assert_eq!(fs.file_name.as_deref(), Some("named.txt"));
  }
}
