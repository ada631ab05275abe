//! Static file serving with policy enforcement and the hot cache.
//!
//! A [`StaticMount`] maps a URL prefix onto a filesystem root with a
//! security policy in front of it. The serve pipeline runs in a fixed
//! order: path policy (traversal, hidden files, extensions) before any
//! filesystem call, then the hot cache, then the async stat/open/read
//! sequence. Every response — full, partial, conditional, or listing —
//! carries the standard security headers.
//!
//! Range requests bypass the cache and stream from disk through
//! [`FileStream`]; cache hits answer full-body requests only.
//!
//! # Examples
//!
//! ```rust,no_run
//! use catzilla::static_files::{MountPolicy, StaticMount};
//! use catzilla::cache::HotCache;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cache = Arc::new(HotCache::new(64 * 1024 * 1024, Duration::from_secs(300)));
//! let mount = StaticMount::builder("/static", "./web")
//!     .policy(MountPolicy::default())
//!     .cache(cache)
//!     .build();
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::arena::{ArenaKind, Arenas};
use crate::body::CatBody;
use crate::cache::HotCache;
use crate::config::ServerConfig;
use crate::error::{EngineError, PolicyDenial};
use crate::extractors::range::RequestedRange;
use crate::file_stream::FileStream;
use crate::responder::Responder;
use crate::types::{Request, Response};

/// Fixed seeds keep ETags stable across restarts.
const ETAG_SEEDS: (u64, u64, u64, u64) = (
    0x6361_747a_696c_6c61,
    0x7374_6174_6963_2121,
    0x6574_6167_5f76_3131,
    0x0123_4567_89ab_cdef,
);

/// Per-mount security and caching policy.
#[derive(Debug, Clone)]
pub struct MountPolicy {
    /// When non-empty, only these extensions (lowercase, no dot) are
    /// served.
    pub allowed_extensions: HashSet<String>,
    /// Always rejected extensions.
    pub blocked_extensions: HashSet<String>,
    /// Largest file served, in bytes.
    pub max_file_size: u64,
    /// Serve through symlinks.
    pub follow_symlinks: bool,
    /// Render listings for directories without an index.
    pub directory_listing: bool,
    /// Serve dotfiles.
    pub serve_hidden: bool,
    /// Emit ETags and answer `If-None-Match`.
    pub enable_etags: bool,
    /// Largest entry admitted to the hot cache.
    pub per_entry_cache_cap: u64,
    /// `max-age` seconds on `Cache-Control`.
    pub cache_control_max_age: u32,
}

impl Default for MountPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: HashSet::new(),
            blocked_extensions: HashSet::new(),
            max_file_size: 100 * 1024 * 1024,
            follow_symlinks: false,
            directory_listing: false,
            serve_hidden: false,
            enable_etags: true,
            per_entry_cache_cap: 1024 * 1024,
            cache_control_max_age: 3600,
        }
    }
}

impl MountPolicy {
    /// Slices the static-serving options out of a [`ServerConfig`].
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            blocked_extensions: config
                .blocked_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            max_file_size: config.max_file_size,
            follow_symlinks: false,
            directory_listing: config.enable_directory_listing,
            serve_hidden: config.enable_hidden_files,
            enable_etags: config.enable_etags,
            ..MountPolicy::default()
        }
    }
}

/// Builder for a [`StaticMount`].
pub struct StaticMountBuilder {
    prefix: String,
    root: PathBuf,
    policy: MountPolicy,
    cache: Option<Arc<HotCache>>,
}

impl StaticMountBuilder {
    pub fn new<P: Into<PathBuf>>(prefix: &str, root: P) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
            root: root.into(),
            policy: MountPolicy::default(),
            cache: None,
        }
    }

    pub fn policy(mut self, policy: MountPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attaches a hot cache shared with other mounts or owned by this
    /// one.
    pub fn cache(mut self, cache: Arc<HotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> StaticMount {
        StaticMount {
            prefix: self.prefix,
            root: self.root,
            policy: self.policy,
            cache: self.cache,
        }
    }
}

/// A (prefix, root, policy) mapping with an optional hot cache.
pub struct StaticMount {
    prefix: String,
    root: PathBuf,
    policy: MountPolicy,
    cache: Option<Arc<HotCache>>,
}

fn normalize_prefix(prefix: &str) -> String {
    let mut p = prefix.trim().to_string();
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

impl StaticMount {
    /// Starts building a mount for `prefix` rooted at `root`.
    pub fn builder<P: Into<PathBuf>>(prefix: &str, root: P) -> StaticMountBuilder {
        StaticMountBuilder::new(prefix, root)
    }

    /// Normalised URL prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Attached hot cache, if any.
    pub fn hot_cache(&self) -> Option<&Arc<HotCache>> {
        self.cache.as_ref()
    }

    /// Whether `path` falls under this mount: equal to the prefix or the
    /// prefix followed by `/`.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        path == self.prefix
            || path
                .strip_prefix(&self.prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Serves one request. Never escapes an error; everything maps to a
    /// response here.
    pub async fn serve(&self, req: Request) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        self.respond(&method, &path, req.headers()).await
    }

    /// The serve pipeline against pre-split request parts.
    pub(crate) async fn respond(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Response {
        let head_only = *method == Method::HEAD;
        match self.respond_inner(method, path, headers).await {
            Ok(mut response) => {
                if head_only {
                    // Identical headers, no body.
                    *response.body_mut() = CatBody::empty();
                }
                response
            }
            Err(err) => {
                let mut response = err.into_response();
                apply_security_headers(response.headers_mut());
                response
            }
        }
    }

    async fn respond_inner(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Response, EngineError> {
        // 1. Path policy, before any filesystem access.
        let rel = self.sanitize(path)?;

        let range = RequestedRange::from_headers(headers)
            .map_err(|_| EngineError::Policy(PolicyDenial::RangeNotSatisfiable))?;

        // 2. Hot cache, full-body requests only.
        if range.is_none()
            && let Some(cache) = &self.cache
            && let Some(view) = cache.get(&rel)
        {
            return Ok(self.hit_response(&rel, view, headers));
        }

        // 3-4. Stat, resolve, read.
        self.disk_response(&rel, method, headers, range).await
    }

    /// Decodes and validates the request path into a clean relative path.
    fn sanitize(&self, path: &str) -> Result<String, EngineError> {
        let rest = if self.prefix == "/" {
            path.strip_prefix('/').unwrap_or(path)
        } else {
            path.strip_prefix(&self.prefix)
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or("")
        };

        let decoded = urlencoding::decode(rest)
            .map_err(|_| EngineError::Input("malformed percent-encoding".into()))?;

        if decoded.contains('\0') || decoded.contains('\\') {
            return Err(EngineError::Policy(PolicyDenial::Forbidden));
        }

        let mut clean = Vec::new();
        for component in decoded.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(EngineError::Policy(PolicyDenial::Forbidden)),
                c if c.contains(':') => {
                    // Windows drive prefixes never belong in a request.
                    return Err(EngineError::Policy(PolicyDenial::Forbidden));
                }
                c if c.starts_with('.') && !self.policy.serve_hidden => {
                    return Err(EngineError::Policy(PolicyDenial::Forbidden));
                }
                c => clean.push(c.to_string()),
            }
        }

        if let Some(last) = clean.last() {
            self.check_extension(last)?;
        }

        Ok(clean.join("/"))
    }

    fn check_extension(&self, file_name: &str) -> Result<(), EngineError> {
        let Some(ext) = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
        else {
            return Ok(());
        };
        if self.policy.blocked_extensions.contains(&ext) {
            return Err(EngineError::Policy(PolicyDenial::Forbidden));
        }
        if !self.policy.allowed_extensions.is_empty()
            && !self.policy.allowed_extensions.contains(&ext)
        {
            return Err(EngineError::Policy(PolicyDenial::Forbidden));
        }
        Ok(())
    }

    /// Full response from a cache hit, handling `If-None-Match`.
    fn hit_response(&self, rel: &str, view: crate::cache::CacheView, headers: &HeaderMap) -> Response {
        let etag_hex = format!("{:016x}", view.etag);
        if self.policy.enable_etags && if_none_match_hits(headers, &etag_hex) {
            return self.not_modified(&etag_hex);
        }

        let mime = mime_guess::from_path(rel).first_or_octet_stream();
        let mut builder = hyper::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime.to_string())
            .header(header::CONTENT_LENGTH, view.bytes.len().to_string())
            .header(header::LAST_MODIFIED, httpdate::fmt_http_date(view.modified));
        if self.policy.enable_etags {
            builder = builder.header(header::ETAG, format!("\"{etag_hex}\""));
        }
        let mut response = builder
            .header(
                header::CACHE_CONTROL,
                format!("public, max-age={}", self.policy.cache_control_max_age),
            )
            .body(CatBody::from(view.bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        apply_security_headers(response.headers_mut());
        response
    }

    async fn disk_response(
        &self,
        rel: &str,
        method: &Method,
        headers: &HeaderMap,
        range: Option<RequestedRange>,
    ) -> Result<Response, EngineError> {
        let joined = self.root.join(rel);

        let canon_root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| EngineError::Policy(PolicyDenial::NotFound))?;

        if !self.policy.follow_symlinks
            && let Ok(meta) = tokio::fs::symlink_metadata(&joined).await
            && meta.file_type().is_symlink()
        {
            return Err(EngineError::Policy(PolicyDenial::Forbidden));
        }

        let canon = tokio::fs::canonicalize(&joined)
            .await
            .map_err(map_fs_error)?;
        if !canon.starts_with(&canon_root) {
            return Err(EngineError::Policy(PolicyDenial::Forbidden));
        }

        let meta = tokio::fs::metadata(&canon).await.map_err(map_fs_error)?;

        let (target, meta, is_dir_index) = if meta.is_dir() {
            // One attempt at index.html, then listing or 403.
            let index = canon.join("index.html");
            match tokio::fs::metadata(&index).await {
                Ok(index_meta) if index_meta.is_file() => {
                    self.check_extension("index.html")?;
                    (index, index_meta, true)
                }
                _ if self.policy.directory_listing => {
                    return self.listing_response(rel, &canon).await;
                }
                _ => return Err(EngineError::Policy(PolicyDenial::Forbidden)),
            }
        } else {
            (canon, meta, false)
        };

        let size = meta.len();
        if size > self.policy.max_file_size {
            return Err(EngineError::Policy(PolicyDenial::TooLarge));
        }

        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let etag = compute_etag(rel, size, modified);
        let etag_hex = format!("{:016x}", etag);

        if self.policy.enable_etags
            && range.is_none()
            && if_none_match_hits(headers, &etag_hex)
        {
            return Ok(self.not_modified(&etag_hex));
        }

        if let Some(range) = range {
            return self
                .range_from_disk(&target, range, size, &etag_hex, modified)
                .await;
        }

        // Directory-index responses are keyed by the directory path, which
        // would poison MIME detection on hits; only real file paths are
        // admitted.
        let cacheable = *method == Method::GET
            && !is_dir_index
            && self.cache.is_some()
            && size <= self.policy.per_entry_cache_cap;

        // Bytes destined for the cache live in its arena; one-shot reads
        // come from the static arena.
        let arena = if cacheable {
            ArenaKind::Cache
        } else {
            ArenaKind::Static
        };
        let bytes = read_file_bytes(&target, size, arena).await?;

        if cacheable && let Some(cache) = &self.cache {
            cache.put(rel, bytes.clone(), etag, modified);
        }

        let mime = mime_guess::from_path(&target).first_or_octet_stream();
        let mut builder = hyper::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime.to_string())
            .header(header::CONTENT_LENGTH, bytes.len().to_string())
            .header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified))
            .header(
                header::CACHE_CONTROL,
                format!("public, max-age={}", self.policy.cache_control_max_age),
            );
        if self.policy.enable_etags {
            builder = builder.header(header::ETAG, format!("\"{etag_hex}\""));
        }
        let mut response = builder
            .body(CatBody::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        apply_security_headers(response.headers_mut());
        Ok(response)
    }

    async fn range_from_disk(
        &self,
        target: &Path,
        range: RequestedRange,
        size: u64,
        etag_hex: &str,
        modified: SystemTime,
    ) -> Result<Response, EngineError> {
        let Some((start, end)) = range.resolve(size) else {
            let mut response = hyper::Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                .body(CatBody::empty())
                .unwrap_or_else(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response());
            apply_security_headers(response.headers_mut());
            return Ok(response);
        };

        // The descriptor is owned by the stream; early connection drops
        // close it with the body.
        let mut response =
            FileStream::<ReaderStream<File>>::range_response(target, start, end, size)
                .await
                .map_err(|err| EngineError::External(format!("range stream: {err}")))?;

        let mime = mime_guess::from_path(target).first_or_octet_stream();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(mime.as_ref())
                .unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&httpdate::fmt_http_date(modified))
                .unwrap_or(HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT")),
        );
        if self.policy.enable_etags
            && let Ok(value) = HeaderValue::from_str(&format!("\"{etag_hex}\""))
        {
            headers.insert(header::ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!(
            "public, max-age={}",
            self.policy.cache_control_max_age
        )) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        apply_security_headers(headers);
        Ok(response)
    }

    async fn listing_response(&self, rel: &str, dir: &Path) -> Result<Response, EngineError> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await.map_err(map_fs_error)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(map_fs_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && !self.policy.serve_hidden {
                continue;
            }
            let meta = entry.metadata().await.map_err(map_fs_error)?;
            let suffix = if meta.is_dir() { "/" } else { "" };
            entries.push((format!("{name}{suffix}"), meta.len()));
        }
        entries.sort();

        let mut html = Arenas::global()
            .alloc(ArenaKind::Response, 4096)
            .ok_or_else(|| EngineError::Resource("response arena exhausted".into()))?;
        html.extend_from_slice(b"<!DOCTYPE html><html><head><title>Index of /");
        html.extend_from_slice(rel.as_bytes());
        html.extend_from_slice(b"</title></head><body><h1>Index of /");
        html.extend_from_slice(rel.as_bytes());
        html.extend_from_slice(b"</h1><ul>");
        for (name, size) in entries {
            html.extend_from_slice(
                format!("<li><a href=\"{name}\">{name}</a> ({size} bytes)</li>").as_bytes(),
            );
        }
        html.extend_from_slice(b"</ul></body></html>");
        let body = html.freeze();

        let mut response = hyper::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CONTENT_LENGTH, body.len().to_string())
            .body(CatBody::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        apply_security_headers(response.headers_mut());
        Ok(response)
    }

    fn not_modified(&self, etag_hex: &str) -> Response {
        let mut builder = hyper::Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(
                header::CACHE_CONTROL,
                format!("public, max-age={}", self.policy.cache_control_max_age),
            );
        builder = builder.header(header::ETAG, format!("\"{etag_hex}\""));
        let mut response = builder
            .body(CatBody::empty())
            .unwrap_or_else(|_| StatusCode::NOT_MODIFIED.into_response());
        apply_security_headers(response.headers_mut());
        response
    }
}

/// 64-bit ETag over path, size and mtime.
fn compute_etag(rel: &str, size: u64, modified: SystemTime) -> u64 {
    let mtime = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let state = ahash::RandomState::with_seeds(
        ETAG_SEEDS.0,
        ETAG_SEEDS.1,
        ETAG_SEEDS.2,
        ETAG_SEEDS.3,
    );
    state.hash_one((rel, size, mtime.as_secs(), mtime.subsec_nanos()))
}

fn if_none_match_hits(headers: &HeaderMap, etag_hex: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    value.split(',').any(|candidate| {
        let candidate = candidate
            .trim()
            .trim_start_matches("W/")
            .trim_matches('"');
        candidate == etag_hex || candidate == "*"
    })
}

/// Reads the whole file through an arena buffer, confirming the stat
/// size against the open descriptor.
async fn read_file_bytes(
    path: &Path,
    expected: u64,
    arena: ArenaKind,
) -> Result<bytes::Bytes, EngineError> {
    let mut file = File::open(path).await?;
    let confirmed = file.metadata().await?.len();
    if confirmed != expected {
        tracing::debug!(path = %path.display(), expected, confirmed, "size changed between stat and open");
    }
    let len = confirmed as usize;
    let mut buf = Arenas::global()
        .alloc(arena, len.max(1))
        .ok_or_else(|| EngineError::Resource("file read arena exhausted".into()))?;
    buf.resize(len);
    file.read_exact(&mut buf[..]).await?;
    Ok(buf.freeze())
}

fn map_fs_error(err: std::io::Error) -> EngineError {
    match err.kind() {
        std::io::ErrorKind::NotFound => EngineError::Policy(PolicyDenial::NotFound),
        std::io::ErrorKind::PermissionDenied => EngineError::Policy(PolicyDenial::Forbidden),
        _ => EngineError::Io(err),
    }
}

/// Standard security headers on every static response.
fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;

    async fn body_bytes(response: Response) -> bytes::Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn mount_for(root: &Path) -> StaticMount {
        StaticMount::builder("/static", root).build()
    }

    fn cached_mount(root: &Path) -> StaticMount {
        StaticMount::builder("/static", root)
            .cache(Arc::new(HotCache::new(
                64 * 1024 * 1024,
                Duration::from_secs(300),
            )))
            .build()
    }

    #[test]
    fn prefix_matching() {
        let dir = tempfile::tempdir().unwrap();
        let mount = mount_for(dir.path());
        assert!(mount.matches("/static"));
        assert!(mount.matches("/static/a.txt"));
        assert!(!mount.matches("/staticfiles"));
        assert!(!mount.matches("/api"));
        assert_eq!(mount.prefix(), "/static");
    }

    #[test]
    fn prefix_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let mount = StaticMount::builder("assets/", dir.path()).build();
        assert_eq!(mount.prefix(), "/assets");
    }

    #[tokio::test]
    async fn serves_a_file_with_full_headers() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("index.html"), b"hello\n")
            .await
            .unwrap();
        let mount = mount_for(dir.path());

        let resp = mount
            .respond(&Method::GET, "/static/index.html", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "6");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/html");
        assert!(resp.headers().contains_key(header::ETAG));
        assert!(resp.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
        assert_eq!(resp.headers()["x-frame-options"], "DENY");
        assert_eq!(resp.headers()["x-xss-protection"], "1; mode=block");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "public, max-age=3600"
        );
        assert_eq!(&body_bytes(resp).await[..], b"hello\n");
    }

    #[tokio::test]
    async fn second_request_hits_the_cache_with_same_etag() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("index.html"), b"hello\n")
            .await
            .unwrap();
        let mount = cached_mount(dir.path());

        let first = mount
            .respond(&Method::GET, "/static/index.html", &HeaderMap::new())
            .await;
        let etag1 = first.headers()[header::ETAG].clone();
        assert_eq!(first.status(), StatusCode::OK);

        let cache = mount.hot_cache().unwrap();
        let misses_before = cache.stats().misses;
        let hits_before = cache.stats().hits;

        let second = mount
            .respond(&Method::GET, "/static/index.html", &HeaderMap::new())
            .await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[header::ETAG], etag1);
        assert_eq!(cache.stats().hits, hits_before + 1);
        assert_eq!(cache.stats().misses, misses_before);
        assert_eq!(&body_bytes(second).await[..], b"hello\n");
    }

    #[tokio::test]
    async fn traversal_is_rejected_without_touching_disk() {
        // Root does not exist: a 403 proves rejection happened before
        // any filesystem call could turn it into 404/500.
        let mount = mount_for(Path::new("/nonexistent-root-for-tests"));
        let resp = mount
            .respond(
                &Method::GET,
                "/static/../../etc/passwd",
                &HeaderMap::new(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn encoded_traversal_is_rejected() {
        let mount = mount_for(Path::new("/nonexistent-root-for-tests"));
        let resp = mount
            .respond(
                &Method::GET,
                "/static/%2e%2e/%2e%2e/etc/passwd",
                &HeaderMap::new(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn directory_with_index_serves_it() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("index.html"), b"home").await.unwrap();
        let mount = mount_for(dir.path());
        let resp = mount
            .respond(&Method::GET, "/static/", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&body_bytes(resp).await[..], b"home");
    }

    #[tokio::test]
    async fn directory_without_index_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let mount = mount_for(dir.path());
        let resp = mount
            .respond(&Method::GET, "/static/", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn directory_listing_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"aaa").await.unwrap();
        tokio::fs::write(dir.path().join(".secret"), b"shh").await.unwrap();
        let mut policy = MountPolicy::default();
        policy.directory_listing = true;
        let mount = StaticMount::builder("/static", dir.path())
            .policy(policy)
            .build();

        let resp = mount
            .respond(&Method::GET, "/static/", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_bytes(resp).await;
        let html = std::str::from_utf8(&body).unwrap();
        assert!(html.contains("a.txt"));
        assert!(!html.contains(".secret"));
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let mount = mount_for(dir.path());
        let resp = mount
            .respond(&Method::GET, "/static/nope.txt", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hidden_files_are_forbidden_by_default() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(".env"), b"SECRET=1").await.unwrap();
        let mount = mount_for(dir.path());
        let resp = mount
            .respond(&Method::GET, "/static/.env", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn blocked_extension_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("tool.exe"), b"MZ").await.unwrap();
        let mut policy = MountPolicy::default();
        policy.blocked_extensions.insert("exe".to_string());
        let mount = StaticMount::builder("/static", dir.path())
            .policy(policy)
            .build();
        let resp = mount
            .respond(&Method::GET, "/static/tool.exe", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn allow_list_excludes_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("ok.css"), b"body{}").await.unwrap();
        tokio::fs::write(dir.path().join("no.js"), b"x()").await.unwrap();
        let mut policy = MountPolicy::default();
        policy.allowed_extensions.insert("css".to_string());
        let mount = StaticMount::builder("/static", dir.path())
            .policy(policy)
            .build();
        let ok = mount
            .respond(&Method::GET, "/static/ok.css", &HeaderMap::new())
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        let no = mount
            .respond(&Method::GET, "/static/no.js", &HeaderMap::new())
            .await;
        assert_eq!(no.status(), StatusCode::FORBIDDEN);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_forbidden_by_default() {
        let outside = tempfile::tempdir().unwrap();
        tokio::fs::write(outside.path().join("secret.txt"), b"outside")
            .await
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            root.path().join("link.txt"),
        )
        .unwrap();

        let mount = mount_for(root.path());
        let resp = mount
            .respond(&Method::GET, "/static/link.txt", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_forbidden_even_when_followed() {
        // With symlink following on, resolution must still stay under the
        // mount root.
        let outside = tempfile::tempdir().unwrap();
        tokio::fs::write(outside.path().join("secret.txt"), b"outside")
            .await
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            root.path().join("link.txt"),
        )
        .unwrap();

        let mut policy = MountPolicy::default();
        policy.follow_symlinks = true;
        let mount = StaticMount::builder("/static", root.path())
            .policy(policy)
            .build();
        let resp = mount
            .respond(&Method::GET, "/static/link.txt", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn oversized_file_is_413() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("big.bin"), vec![0u8; 1000])
            .await
            .unwrap();
        let mut policy = MountPolicy::default();
        policy.max_file_size = 100;
        let mount = StaticMount::builder("/static", dir.path())
            .policy(policy)
            .build();
        let resp = mount
            .respond(&Method::GET, "/static/big.bin", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn head_has_headers_but_no_body() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("doc.txt"), b"words here").await.unwrap();
        let mount = mount_for(dir.path());
        let resp = mount
            .respond(&Method::HEAD, "/static/doc.txt", &HeaderMap::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "10");
        assert!(body_bytes(resp).await.is_empty());
    }

    #[tokio::test]
    async fn if_none_match_yields_304() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("page.html"), b"cached").await.unwrap();
        let mount = mount_for(dir.path());

        let first = mount
            .respond(&Method::GET, "/static/page.html", &HeaderMap::new())
            .await;
        let etag = first.headers()[header::ETAG].clone();

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, etag.clone());
        let second = mount
            .respond(&Method::GET, "/static/page.html", &headers)
            .await;
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(second.headers()[header::ETAG], etag);
        assert!(body_bytes(second).await.is_empty());
    }

    #[tokio::test]
    async fn range_request_returns_206_slice() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("data.bin"), b"0123456789")
            .await
            .unwrap();
        let mount = mount_for(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=2-5".parse().unwrap());
        let resp = mount
            .respond(&Method::GET, "/static/data.bin", &headers)
            .await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(&body_bytes(resp).await[..], b"2345");
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("data.bin"), b"0123456789")
            .await
            .unwrap();
        let mount = mount_for(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=100-200".parse().unwrap());
        let resp = mount
            .respond(&Method::GET, "/static/data.bin", &headers)
            .await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[test]
    fn etag_is_stable_and_sensitive() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = compute_etag("a/b.txt", 100, t);
        let b = compute_etag("a/b.txt", 100, t);
        assert_eq!(a, b);
        assert_ne!(a, compute_etag("a/b.txt", 101, t));
        assert_ne!(
            a,
            compute_etag("a/b.txt", 100, t + Duration::from_secs(1))
        );
        assert_ne!(a, compute_etag("a/c.txt", 100, t));
    }
}
