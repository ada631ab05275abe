//! Streaming multipart upload pipeline.
//!
//! Body bytes are consumed as they arrive off the connection; each part
//! flows into a sink that starts in an 8 KiB buffer and upgrades through
//! the 64 KiB class until it crosses the spill threshold, at which point
//! the buffered bytes are flushed to a uniquely named temporary file and
//! the remaining chunks append there. Part buffers are arena blocks from
//! the request domain of [`Arenas`], checked out through a
//! [`BufferPool`] that pre-warms the configured count per size class and
//! applies watermark backpressure: when no pooled buffer is free and the
//! in-flight byte total is past the watermark, the pipeline waits on a
//! `Notify` for a release before reading further — that await is what
//! pauses the connection.
//!
//! Temporary files unlink when the [`UploadFile`] drops, unless
//! [`UploadFile::persist`] moved them out first. A part that violates
//! policy fails the whole request and the drop path cleans up every
//! partial file. Part headers follow RFC 7578: the first
//! `Content-Disposition` wins and duplicate parameters are ignored.
//!
//! A pipeline built with [`UploadPipeline::with_scanner`] schedules a
//! virus scan on the task engine as each part finishes writing; the
//! verdict lands on the part's [`UploadFile`] when the worker completes
//! the scan.
//!
//! # Examples
//!
//! ```rust,no_run
//! use catzilla::multipart::{UploadConfig, UploadPipeline};
//! use catzilla::types::Request;
//! use http_body_util::BodyExt;
//!
//! async fn upload_handler(req: Request) -> anyhow::Result<()> {
//!   let boundary = multer::parse_boundary(
//!     req.headers()[http::header::CONTENT_TYPE].to_str()?,
//!   )?;
//!   let pipeline = UploadPipeline::new(UploadConfig::default());
//!   let files = pipeline
//!     .process(req.into_body().into_data_stream(), boundary)
//!     .await?;
//!   for file in &files {
//!     println!("{}: {} bytes", file.field_name, file.size);
//!   }
//!   Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::Stream;
use http::StatusCode;
use multer::Multipart;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::arena::{ArenaBuf, ArenaKind, Arenas};
use crate::clamav::{ScanVerdict, VirusScanner, schedule_virus_scan};
use crate::engine::TaskEngine;
use crate::queue::Priority;
use crate::responder::Responder;

/// Buffer size classes, one pool bucket each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
  /// 8 KiB.
  Small,
  /// 64 KiB.
  Medium,
  /// 1 MiB.
  Large,
}

impl SizeClass {
  /// Buffer capacity of this class.
  pub fn capacity(self) -> usize {
    match self {
      SizeClass::Small => 8 * 1024,
      SizeClass::Medium => 64 * 1024,
      SizeClass::Large => 1024 * 1024,
    }
  }

  fn index(self) -> usize {
    match self {
      SizeClass::Small => 0,
      SizeClass::Medium => 1,
      SizeClass::Large => 2,
    }
  }

  fn next(self) -> Option<SizeClass> {
    match self {
      SizeClass::Small => Some(SizeClass::Medium),
      SizeClass::Medium => Some(SizeClass::Large),
      SizeClass::Large => None,
    }
  }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
  /// Checkouts satisfied by a pre-warmed pool slot.
  pub reused: u64,
  /// Checkouts that went to the arena cold.
  pub allocated: u64,
  /// Times a checkout had to wait for a release.
  pub waited: u64,
}

/// Upload buffer pool over the request arena.
///
/// The pool does not own chunk storage itself: buffers are
/// [`ArenaBuf`]s from [`ArenaKind::Request`], and releasing one returns
/// its chunk to that arena's free list. What the pool adds is the
/// per-class slot accounting (pre-populated counts, in-flight bytes) and
/// the watermark backpressure the parser relies on.
pub struct BufferPool {
  arenas: &'static Arenas,
  /// Free slots per class; starts at the configured pre-populated count
  /// and follows checkouts/releases.
  available: [AtomicUsize; 3],
  in_flight_bytes: AtomicU64,
  watermark: u64,
  released: Notify,
  reused: AtomicU64,
  allocated: AtomicU64,
  waited: AtomicU64,
}

impl BufferPool {
  /// Builds a pool over the process-wide arenas with
  /// `small`/`medium`/`large` pre-populated buffers per class and the
  /// given in-flight byte watermark.
  pub fn new(small: usize, medium: usize, large: usize, watermark: u64) -> Self {
    Self::with_arenas(Arenas::global(), small, medium, large, watermark)
  }

  pub(crate) fn with_arenas(
    arenas: &'static Arenas,
    small: usize,
    medium: usize,
    large: usize,
    watermark: u64,
  ) -> Self {
    // Warm the request arena so the pre-populated buffers are pooled
    // chunks rather than first-touch heap allocations.
    for (class, count) in [
      (SizeClass::Small, small),
      (SizeClass::Medium, medium),
      (SizeClass::Large, large),
    ] {
      for _ in 0..count {
        if let Some(buf) = arenas.alloc(ArenaKind::Request, class.capacity()) {
          arenas.free(ArenaKind::Request, buf);
        }
      }
    }
    Self {
      arenas,
      available: [
        AtomicUsize::new(small),
        AtomicUsize::new(medium),
        AtomicUsize::new(large),
      ],
      in_flight_bytes: AtomicU64::new(0),
      watermark,
      released: Notify::new(),
      reused: AtomicU64::new(0),
      allocated: AtomicU64::new(0),
      waited: AtomicU64::new(0),
    }
  }

  /// Checks a buffer out, waiting for a release when the pool is dry and
  /// the watermark is exceeded. The await here is the backpressure point.
  pub async fn checkout(self: &Arc<Self>, class: SizeClass) -> PooledBuf {
    loop {
      if let Some(buf) = self.try_checkout(class) {
        return buf;
      }
      // Register before the re-check so a release between the two cannot
      // be lost.
      let notified = self.released.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if let Some(buf) = self.try_checkout(class) {
        return buf;
      }
      self.waited.fetch_add(1, Ordering::Relaxed);
      notified.await;
    }
  }

  fn try_checkout(self: &Arc<Self>, class: SizeClass) -> Option<PooledBuf> {
    let had_slot = self.claim_slot(class);
    if !had_slot && self.in_flight_bytes.load(Ordering::Relaxed) >= self.watermark {
      return None;
    }
    let Some(buf) = self.arenas.alloc(ArenaKind::Request, class.capacity()) else {
      // Heap exhaustion reads as a dry pool: hand the slot back and let
      // the caller wait for a release.
      if had_slot {
        self.available[class.index()].fetch_add(1, Ordering::Relaxed);
      }
      return None;
    };
    if had_slot {
      self.reused.fetch_add(1, Ordering::Relaxed);
    } else {
      self.allocated.fetch_add(1, Ordering::Relaxed);
    }
    self
      .in_flight_bytes
      .fetch_add(class.capacity() as u64, Ordering::Relaxed);
    Some(PooledBuf {
      data: Some(buf),
      class,
      pool: self.clone(),
    })
  }

  fn claim_slot(&self, class: SizeClass) -> bool {
    let cell = &self.available[class.index()];
    let mut current = cell.load(Ordering::Relaxed);
    while current > 0 {
      match cell.compare_exchange_weak(
        current,
        current - 1,
        Ordering::Relaxed,
        Ordering::Relaxed,
      ) {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
    false
  }

  fn release(&self, class: SizeClass, buf: ArenaBuf) {
    self.arenas.free(ArenaKind::Request, buf);
    self.available[class.index()].fetch_add(1, Ordering::Relaxed);
    self
      .in_flight_bytes
      .fetch_sub(class.capacity() as u64, Ordering::Relaxed);
    self.released.notify_waiters();
  }

  /// Bytes currently checked out across all classes.
  pub fn in_flight_bytes(&self) -> u64 {
    self.in_flight_bytes.load(Ordering::Relaxed)
  }

  /// Counter snapshot.
  pub fn stats(&self) -> PoolStats {
    PoolStats {
      reused: self.reused.load(Ordering::Relaxed),
      allocated: self.allocated.load(Ordering::Relaxed),
      waited: self.waited.load(Ordering::Relaxed),
    }
  }
}

/// A checked-out request-arena buffer; returns to the arena on drop.
pub struct PooledBuf {
  /// Present until the drop path hands the block back.
  data: Option<ArenaBuf>,
  class: SizeClass,
  pool: Arc<BufferPool>,
}

impl PooledBuf {
  /// Size class this buffer belongs to.
  pub fn class(&self) -> SizeClass {
    self.class
  }

  fn extend(&mut self, bytes: &[u8]) {
    if let Some(buf) = self.data.as_mut() {
      buf.extend_from_slice(bytes);
    }
  }

  fn len(&self) -> usize {
    self.data.as_ref().map_or(0, |b| b.len())
  }

  fn capacity(&self) -> usize {
    self.data.as_ref().map_or(0, |b| b.capacity())
  }
}

impl std::ops::Deref for PooledBuf {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.data.as_deref().unwrap_or(&[])
  }
}

impl Drop for PooledBuf {
  fn drop(&mut self) {
    if let Some(buf) = self.data.take() {
      self.pool.release(self.class, buf);
    }
  }
}

/// Where a finished part's bytes live.
enum Backing {
  Memory(PooledBuf),
  Disk { path: PathBuf, persisted: bool },
}

/// Scan outcome recorded on an upload after the hand-off ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadScanVerdict {
  Clean,
  Infected(String),
  Error(String),
}

fn map_scan_verdict(verdict: ScanVerdict) -> UploadScanVerdict {
  match verdict {
    ScanVerdict::Clean => UploadScanVerdict::Clean,
    ScanVerdict::Infected(name) => UploadScanVerdict::Infected(name),
    ScanVerdict::Error(msg) => UploadScanVerdict::Error(msg),
    ScanVerdict::Unavailable => UploadScanVerdict::Error("scanner unavailable".to_string()),
  }
}

type VerdictCell = Arc<Mutex<Option<UploadScanVerdict>>>;

/// One completed multipart part.
pub struct UploadFile {
  /// `name` parameter of the part's Content-Disposition.
  pub field_name: String,
  /// Original client filename, when sent.
  pub file_name: Option<String>,
  /// Declared content type of the part.
  pub content_type: Option<String>,
  /// Total part size in bytes.
  pub size: u64,
  backing: Backing,
  /// Filled in by the scan worker after the hand-off completes.
  verdict: VerdictCell,
}

impl UploadFile {
  /// True when the part spilled to a temporary file.
  pub fn is_on_disk(&self) -> bool {
    matches!(self.backing, Backing::Disk { .. })
  }

  /// Temporary file path for disk-backed parts.
  pub fn temp_path(&self) -> Option<&Path> {
    match &self.backing {
      Backing::Disk { path, .. } => Some(path),
      Backing::Memory(_) => None,
    }
  }

  /// In-memory bytes for memory-backed parts.
  pub fn bytes(&self) -> Option<&[u8]> {
    match &self.backing {
      Backing::Memory(buf) => Some(buf),
      Backing::Disk { .. } => None,
    }
  }

  /// Verdict of the scheduled virus scan, once the worker has run it.
  /// `None` while the scan is pending or when no scanner was configured.
  pub fn scan_verdict(&self) -> Option<UploadScanVerdict> {
    self.verdict.lock().clone()
  }

  /// Moves the content to `dest`, disarming the unlink-on-drop cleanup.
  pub async fn persist(&mut self, dest: &Path) -> std::io::Result<()> {
    match &mut self.backing {
      Backing::Memory(buf) => {
        tokio::fs::write(dest, &buf[..]).await?;
      }
      Backing::Disk { path, persisted } => {
        match tokio::fs::rename(&*path, dest).await {
          Ok(()) => {}
          Err(_) => {
            // Cross-device fallback.
            tokio::fs::copy(&*path, dest).await?;
            let _ = tokio::fs::remove_file(&*path).await;
          }
        }
        *persisted = true;
      }
    }
    Ok(())
  }
}

impl Drop for UploadFile {
  fn drop(&mut self) {
    if let Backing::Disk { path, persisted } = &self.backing
      && !persisted
    {
      let _ = std::fs::remove_file(path);
    }
  }
}

impl std::fmt::Debug for UploadFile {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UploadFile")
      .field("field_name", &self.field_name)
      .field("file_name", &self.file_name)
      .field("size", &self.size)
      .field("on_disk", &self.is_on_disk())
      .field("scan_verdict", &self.scan_verdict())
      .finish()
  }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct UploadConfig {
  /// Pre-populated 8 KiB buffers.
  pub small_capacity: usize,
  /// Pre-populated 64 KiB buffers.
  pub medium_capacity: usize,
  /// Pre-populated 1 MiB buffers.
  pub large_capacity: usize,
  /// In-flight bytes past which a dry pool pauses the stream.
  pub watermark_bytes: u64,
  /// Parts growing past this spill to disk.
  pub spill_threshold: u64,
  /// Hard per-part cap; crossing it fails the whole request.
  pub max_part_size: u64,
  /// Directory for spilled parts and scan scratch files.
  pub temp_dir: PathBuf,
}

impl Default for UploadConfig {
  fn default() -> Self {
    Self {
      small_capacity: 64,
      medium_capacity: 32,
      large_capacity: 8,
      watermark_bytes: 64 * 1024 * 1024,
      spill_threshold: 64 * 1024,
      max_part_size: 100 * 1024 * 1024,
      temp_dir: std::env::temp_dir(),
    }
  }
}

impl UploadConfig {
  /// Slices the upload options out of a [`ServerConfig`](crate::config::ServerConfig).
  pub fn from_config(config: &crate::config::ServerConfig) -> Self {
    Self {
      small_capacity: config.upload_memory_pool_small_capacity,
      medium_capacity: config.upload_memory_pool_medium_capacity,
      large_capacity: config.upload_memory_pool_large_capacity,
      max_part_size: config.max_file_size,
      temp_dir: config.upload_temp_directory.clone(),
      ..UploadConfig::default()
    }
  }
}

/// Multipart processing failures.
#[derive(Debug)]
pub enum UploadError {
  /// Malformed multipart framing or headers.
  Parse(String),
  /// A part without a Content-Disposition name.
  UnnamedPart,
  /// A part crossed the configured size cap.
  PartTooLarge { field: String, limit: u64 },
  /// Temp file I/O failed.
  Io(std::io::Error),
}

impl From<std::io::Error> for UploadError {
  fn from(e: std::io::Error) -> Self {
    UploadError::Io(e)
  }
}

impl std::fmt::Display for UploadError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      UploadError::Parse(msg) => write!(f, "malformed multipart body: {msg}"),
      UploadError::UnnamedPart => write!(f, "part missing a field name"),
      UploadError::PartTooLarge { field, limit } => {
        write!(f, "part '{field}' exceeds the {limit}-byte limit")
      }
      UploadError::Io(e) => write!(f, "upload i/o error: {e}"),
    }
  }
}

impl std::error::Error for UploadError {}

impl Responder for UploadError {
  fn into_response(self) -> crate::types::Response {
    match self {
      UploadError::Parse(_) | UploadError::UnnamedPart => {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
      }
      UploadError::PartTooLarge { .. } => {
        (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()).into_response()
      }
      UploadError::Io(e) => {
        tracing::error!(error = %e, "upload failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
      }
    }
  }
}

/// Unlinks an in-progress spill file unless the part completed.
struct TempGuard {
  path: PathBuf,
  armed: bool,
}

impl TempGuard {
  fn new(path: PathBuf) -> Self {
    Self { path, armed: true }
  }

  fn disarm(mut self) -> PathBuf {
    self.armed = false;
    std::mem::take(&mut self.path)
  }
}

impl Drop for TempGuard {
  fn drop(&mut self) {
    if self.armed {
      let _ = std::fs::remove_file(&self.path);
    }
  }
}

/// Per-part sink driving the memory → spill progression.
enum PartSink {
  Memory(PooledBuf),
  Disk {
    file: File,
    guard: TempGuard,
    written: u64,
  },
}

/// Scanner and engine handles for the per-part scan hand-off.
struct ScanHandoff {
  engine: TaskEngine,
  scanner: Arc<dyn VirusScanner>,
}

/// The streaming upload pipeline.
pub struct UploadPipeline {
  pool: Arc<BufferPool>,
  config: UploadConfig,
  scan: Option<ScanHandoff>,
}

impl UploadPipeline {
  pub fn new(config: UploadConfig) -> Self {
    let pool = Arc::new(BufferPool::new(
      config.small_capacity,
      config.medium_capacity,
      config.large_capacity,
      config.watermark_bytes,
    ));
    Self {
      pool,
      config,
      scan: None,
    }
  }

  /// Enables the virus-scan hand-off: each completed part is submitted
  /// to `engine` and scanned with `scanner`, and the verdict is recorded
  /// on the part's [`UploadFile`].
  pub fn with_scanner(mut self, engine: TaskEngine, scanner: Arc<dyn VirusScanner>) -> Self {
    self.scan = Some(ScanHandoff { engine, scanner });
    self
  }

  /// Shared buffer pool, for inspection and reuse across pipelines.
  pub fn pool(&self) -> &Arc<BufferPool> {
    &self.pool
  }

  /// Consumes a multipart body stream and returns the completed parts.
  ///
  /// Any failure unwinds every partial temporary file before returning.
  pub async fn process<S, E>(
    &self,
    stream: S,
    boundary: String,
  ) -> Result<Vec<UploadFile>, UploadError>
  where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
  {
    let mut multipart = Multipart::new(stream, boundary);
    let mut files = Vec::new();

    while let Some(mut field) = multipart
      .next_field()
      .await
      .map_err(|e| UploadError::Parse(e.to_string()))?
    {
      let field_name = field
        .name()
        .map(|s| s.to_owned())
        .ok_or(UploadError::UnnamedPart)?;
      let file_name = field.file_name().map(|s| s.to_owned());
      let content_type = field.content_type().map(|m| m.to_string());

      let mut sink = PartSink::Memory(self.pool.checkout(SizeClass::Small).await);
      let mut total: u64 = 0;

      while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| UploadError::Parse(e.to_string()))?
      {
        total += chunk.len() as u64;
        if total > self.config.max_part_size {
          return Err(UploadError::PartTooLarge {
            field: field_name,
            limit: self.config.max_part_size,
          });
        }
        sink = self.write_chunk(sink, &chunk).await?;
      }

      let backing = match sink {
        PartSink::Memory(buf) => Backing::Memory(buf),
        PartSink::Disk {
          mut file, guard, ..
        } => {
          file.flush().await?;
          drop(file);
          Backing::Disk {
            path: guard.disarm(),
            persisted: false,
          }
        }
      };

      let file = UploadFile {
        field_name,
        file_name,
        content_type,
        size: total,
        backing,
        verdict: Arc::new(Mutex::new(None)),
      };
      // The part is fully written here; the scan runs on the engine and
      // reports back into the file's verdict cell.
      self.schedule_scan(&file).await?;
      files.push(file);
    }

    Ok(files)
  }

  /// Hands a completed part to the task engine for scanning, when a
  /// scanner is configured. Memory-backed parts are staged to a scratch
  /// file for the path-based scan interface and the scratch is unlinked
  /// with the verdict.
  async fn schedule_scan(&self, file: &UploadFile) -> Result<(), UploadError> {
    let Some(handoff) = &self.scan else {
      return Ok(());
    };

    let (scan_path, scratch) = match &file.backing {
      Backing::Disk { path, .. } => (path.clone(), None),
      Backing::Memory(buf) => {
        let scratch = self
          .config
          .temp_dir
          .join(format!("czscan-{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&scratch, &buf[..]).await?;
        (scratch.clone(), Some(scratch))
      }
    };

    let cell = file.verdict.clone();
    let cleanup = scratch.clone();
    let scheduled = schedule_virus_scan(
      &handoff.engine,
      handoff.scanner.clone(),
      scan_path,
      Priority::Normal,
      move |verdict| {
        *cell.lock() = Some(map_scan_verdict(verdict));
        if let Some(path) = &cleanup {
          let _ = std::fs::remove_file(path);
        }
      },
    );

    if scheduled.is_none() {
      tracing::warn!(field = file.field_name, "scan queue saturated");
      *file.verdict.lock() =
        Some(UploadScanVerdict::Error("scan queue saturated".to_string()));
      if let Some(path) = &scratch {
        let _ = tokio::fs::remove_file(path).await;
      }
    }
    Ok(())
  }

  /// Routes one chunk into the sink, upgrading buffer classes and
  /// spilling to disk when the thresholds demand it.
  async fn write_chunk(&self, sink: PartSink, chunk: &[u8]) -> Result<PartSink, UploadError> {
    match sink {
      PartSink::Memory(mut buf) => {
        let needed = buf.len() + chunk.len();
        if needed <= buf.capacity() {
          buf.extend(chunk);
          return Ok(PartSink::Memory(buf));
        }

        if (needed as u64) <= self.config.spill_threshold {
          // Upgrade through the size classes while the part still fits
          // in memory.
          let mut class = buf.class();
          while let Some(next) = class.next() {
            class = next;
            if needed <= class.capacity() {
              break;
            }
          }
          let mut bigger = self.pool.checkout(class).await;
          bigger.extend(&buf);
          bigger.extend(chunk);
          drop(buf);
          return Ok(PartSink::Memory(bigger));
        }

        // Crossed the in-memory threshold: flush what we have and
        // stream the rest to disk.
        let path = self.temp_path();
        let guard = TempGuard::new(path.clone());
        let mut file = File::create(&path).await?;
        file.write_all(&buf).await?;
        file.write_all(chunk).await?;
        let written = (buf.len() + chunk.len()) as u64;
        drop(buf);
        Ok(PartSink::Disk {
          file,
          guard,
          written,
        })
      }
      PartSink::Disk {
        mut file,
        guard,
        written,
      } => {
        file.write_all(chunk).await?;
        Ok(PartSink::Disk {
          file,
          guard,
          written: written + chunk.len() as u64,
        })
      }
    }
  }

  fn temp_path(&self) -> PathBuf {
    self
      .config
      .temp_dir
      .join(format!("czupload-{}.part", Uuid::new_v4()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures_util::stream;

  fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> (Vec<u8>, String) {
    let boundary = "testboundary42".to_string();
    let mut body = Vec::new();
    for (name, filename, content) in parts {
      body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
      match filename {
        Some(f) => body.extend_from_slice(
          format!(
            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
          )
          .as_bytes(),
        ),
        None => body.extend_from_slice(
          format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        ),
      }
      body.extend_from_slice(content);
      body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (body, boundary)
  }

  fn byte_stream(
    body: Vec<u8>,
    chunk_size: usize,
  ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let chunks: Vec<_> = body
      .chunks(chunk_size)
      .map(|c| Ok(Bytes::copy_from_slice(c)))
      .collect();
    stream::iter(chunks)
  }

  fn test_config(temp_dir: &Path) -> UploadConfig {
    UploadConfig {
      temp_dir: temp_dir.to_path_buf(),
      ..UploadConfig::default()
    }
  }

  fn temp_part_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
      .unwrap()
      .filter_map(|e| e.ok())
      .filter(|e| e.file_name().to_string_lossy().starts_with("czupload-"))
      .count()
  }

  fn scratch_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
      .unwrap()
      .filter_map(|e| e.ok())
      .filter(|e| e.file_name().to_string_lossy().starts_with("czscan-"))
      .count()
  }

  #[tokio::test]
  async fn small_text_field_stays_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let (body, boundary) = multipart_body(&[("title", None, b"hello world")]);
    let pipeline = UploadPipeline::new(test_config(dir.path()));

    let files = pipeline
      .process(byte_stream(body, 1024), boundary)
      .await
      .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].field_name, "title");
    assert_eq!(files[0].size, 11);
    assert!(!files[0].is_on_disk());
    assert_eq!(files[0].bytes().unwrap(), b"hello world");
    assert_eq!(files[0].scan_verdict(), None);
    assert_eq!(temp_part_count(dir.path()), 0);
  }

  #[tokio::test]
  async fn large_part_spills_to_exactly_one_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![0xAB_u8; 2 * 1024 * 1024];
    let (body, boundary) = multipart_body(&[("file", Some("big.bin"), &payload)]);
    let pipeline = UploadPipeline::new(test_config(dir.path()));

    let files = pipeline
      .process(byte_stream(body, 16 * 1024), boundary)
      .await
      .unwrap();
    assert_eq!(files.len(), 1);
    let file = &files[0];
    assert!(file.is_on_disk());
    assert_eq!(file.size, payload.len() as u64);
    assert_eq!(temp_part_count(dir.path()), 1);

    let disk_len = std::fs::metadata(file.temp_path().unwrap()).unwrap().len();
    assert_eq!(disk_len, payload.len() as u64);

    // Request completion without persist unlinks the temp file.
    drop(files);
    assert_eq!(temp_part_count(dir.path()), 0);
  }

  #[tokio::test]
  async fn persist_moves_file_and_disarms_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![0x5A_u8; 200 * 1024];
    let (body, boundary) = multipart_body(&[("file", Some("keep.bin"), &payload)]);
    let pipeline = UploadPipeline::new(test_config(dir.path()));

    let mut files = pipeline
      .process(byte_stream(body, 8 * 1024), boundary)
      .await
      .unwrap();
    let dest = dir.path().join("persisted.bin");
    files[0].persist(&dest).await.unwrap();
    drop(files);

    assert_eq!(temp_part_count(dir.path()), 0);
    assert_eq!(
      std::fs::metadata(&dest).unwrap().len(),
      payload.len() as u64
    );
  }

  #[tokio::test]
  async fn oversized_part_fails_request_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![1_u8; 512 * 1024];
    let (body, boundary) = multipart_body(&[
      ("first", Some("a.bin"), &payload),
      ("second", Some("b.bin"), &payload),
    ]);
    let mut config = test_config(dir.path());
    config.max_part_size = 300 * 1024;
    let pipeline = UploadPipeline::new(config);

    let err = pipeline
      .process(byte_stream(body, 8 * 1024), boundary)
      .await
      .unwrap_err();
    assert!(matches!(err, UploadError::PartTooLarge { .. }));
    // Partial temp files from the failed request are unlinked.
    assert_eq!(temp_part_count(dir.path()), 0);
  }

  #[tokio::test]
  async fn mixed_fields_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let blob = vec![7_u8; 100 * 1024];
    let (body, boundary) = multipart_body(&[
      ("description", None, b"an upload"),
      ("attachment", Some("blob.bin"), &blob),
    ]);
    let pipeline = UploadPipeline::new(test_config(dir.path()));

    let files = pipeline
      .process(byte_stream(body, 4 * 1024), boundary)
      .await
      .unwrap();
    assert_eq!(files.len(), 2);
    assert!(!files[0].is_on_disk());
    assert_eq!(files[0].content_type, None);
    assert!(files[1].is_on_disk());
    assert_eq!(
      files[1].content_type.as_deref(),
      Some("application/octet-stream")
    );
    assert_eq!(files[1].file_name.as_deref(), Some("blob.bin"));
  }

  #[tokio::test]
  async fn medium_part_upgrades_class_without_spilling() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![3_u8; 20 * 1024];
    let (body, boundary) = multipart_body(&[("mid", Some("mid.bin"), &payload)]);
    let pipeline = UploadPipeline::new(test_config(dir.path()));

    let files = pipeline
      .process(byte_stream(body, 4 * 1024), boundary)
      .await
      .unwrap();
    assert!(!files[0].is_on_disk());
    assert_eq!(files[0].size, payload.len() as u64);
    assert_eq!(temp_part_count(dir.path()), 0);
  }

  #[tokio::test]
  async fn pool_buffers_come_from_the_request_arena() {
    // A private arena set keeps the byte accounting deterministic.
    let arenas: &'static Arenas = Box::leak(Box::new(Arenas::new()));
    let pool = Arc::new(BufferPool::with_arenas(arenas, 1, 0, 0, 1024 * 1024));
    let request = ArenaKind::Request.id() as usize;
    assert_eq!(arenas.stats().bytes_in_use[request], 0);

    let buf = pool.checkout(SizeClass::Small).await;
    assert_eq!(
      arenas.stats().bytes_in_use[request],
      SizeClass::Small.capacity() as u64,
    );
    // The warmed chunk was recycled rather than freshly allocated.
    assert!(arenas.stats().cache_hits >= 1);

    drop(buf);
    assert_eq!(arenas.stats().bytes_in_use[request], 0);
    assert_eq!(arenas.stats().allocations, arenas.stats().deallocations);
  }

  #[tokio::test]
  async fn pool_reuses_released_buffers() {
    let pool = Arc::new(BufferPool::new(2, 0, 0, 1024 * 1024));
    let a = pool.checkout(SizeClass::Small).await;
    let b = pool.checkout(SizeClass::Small).await;
    drop(a);
    drop(b);
    let _c = pool.checkout(SizeClass::Small).await;
    let stats = pool.stats();
    assert_eq!(stats.reused, 3);
    assert_eq!(stats.allocated, 0);
  }

  #[tokio::test]
  async fn exhausted_pool_past_watermark_waits_for_release() {
    // One pre-populated small buffer and a watermark below one buffer:
    // the second checkout must wait until the first is released.
    let pool = Arc::new(BufferPool::new(1, 0, 0, 1));
    let held = pool.checkout(SizeClass::Small).await;

    let waiter = {
      let pool = pool.clone();
      tokio::spawn(async move { pool.checkout(SizeClass::Small).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "checkout should be blocked");

    drop(held);
    let got = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
      .await
      .expect("checkout did not resume after release")
      .unwrap();
    assert_eq!(got.class(), SizeClass::Small);
    assert!(pool.stats().waited >= 1);
  }

  mod scan_handoff {
    use super::*;
    use crate::clamav::{ScanReport, ScanStats, ScannerStatus};
    use crate::engine::EngineConfig;
    use std::time::Duration;

    struct AlwaysClean;

    #[async_trait::async_trait]
    impl VirusScanner for AlwaysClean {
      async fn scan(&self, path: &Path) -> ScanReport {
        ScanReport {
          scanned_path: path.to_path_buf(),
          file_size: 0,
          is_infected: false,
          threat_name: None,
          engine_version: None,
          scan_time_seconds: 0.0,
          exit_code: 0,
          is_error: false,
          error_message: None,
        }
      }

      async fn status(&self) -> ScannerStatus {
        ScannerStatus::BinaryFound
      }

      async fn version(&self) -> Option<String> {
        None
      }

      fn stats(&self) -> ScanStats {
        ScanStats::default()
      }
    }

    fn scan_engine() -> TaskEngine {
      TaskEngine::start(EngineConfig {
        initial_workers: 1,
        min_workers: 1,
        max_workers: 1,
        enable_auto_scaling: false,
        ..EngineConfig::default()
      })
    }

    async fn wait_for_verdict(file: &UploadFile) -> UploadScanVerdict {
      let deadline = std::time::Instant::now() + Duration::from_secs(5);
      loop {
        if let Some(verdict) = file.scan_verdict() {
          return verdict;
        }
        assert!(
          std::time::Instant::now() < deadline,
          "scan verdict never arrived",
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spilled_part_is_scanned_and_verdict_recorded() {
      let dir = tempfile::tempdir().unwrap();
      let payload = vec![0xCD_u8; 200 * 1024];
      let (body, boundary) = multipart_body(&[("file", Some("scan.bin"), &payload)]);
      let engine = scan_engine();
      let pipeline = UploadPipeline::new(test_config(dir.path()))
        .with_scanner(engine.clone(), Arc::new(AlwaysClean));

      let files = pipeline
        .process(byte_stream(body, 8 * 1024), boundary)
        .await
        .unwrap();
      assert!(files[0].is_on_disk());
      assert_eq!(wait_for_verdict(&files[0]).await, UploadScanVerdict::Clean);
      engine.stop(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn memory_part_is_scanned_via_scratch_file() {
      let dir = tempfile::tempdir().unwrap();
      let (body, boundary) = multipart_body(&[("note", None, b"small body")]);
      let engine = scan_engine();
      let pipeline = UploadPipeline::new(test_config(dir.path()))
        .with_scanner(engine.clone(), Arc::new(AlwaysClean));

      let files = pipeline
        .process(byte_stream(body, 1024), boundary)
        .await
        .unwrap();
      assert!(!files[0].is_on_disk());
      assert_eq!(wait_for_verdict(&files[0]).await, UploadScanVerdict::Clean);

      // The staging file is unlinked together with the verdict.
      let deadline = std::time::Instant::now() + Duration::from_secs(5);
      while scratch_count(dir.path()) > 0 {
        assert!(std::time::Instant::now() < deadline, "scratch file leaked");
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
      engine.stop(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unavailable_scanner_reports_error_verdict() {
      let dir = tempfile::tempdir().unwrap();
      let payload = vec![9_u8; 100 * 1024];
      let (body, boundary) = multipart_body(&[("file", Some("x.bin"), &payload)]);
      let engine = scan_engine();
      let pipeline = UploadPipeline::new(test_config(dir.path())).with_scanner(
        engine.clone(),
        Arc::new(crate::clamav::UnavailableScanner::new()),
      );

      let files = pipeline
        .process(byte_stream(body, 8 * 1024), boundary)
        .await
        .unwrap();
      assert!(matches!(
        wait_for_verdict(&files[0]).await,
        UploadScanVerdict::Error(_)
      ));
      engine.stop(true);
    }
  }
}
