//! Static file fast path: URL-to-file resolution, conditional GET, ranges,
//! and directory-index handling.
//!
//! Grounded on `NsFastPathProc` / `FastReturn` / `Ns_UrlIsFile` /
//! `Ns_UrlIsDir` in `fastpath.c`. The original's ADP (scripted page)
//! handling for directory listings is out of scope — this crate only ever
//! answers with a static file or a redirect — but the stat-then-dispatch
//! shape and the refcounted revalidate-or-rebuild cache protocol are kept.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::cache::{CacheKey, FileCache};
use crate::config::ConfigStore;
use crate::emitter::{self, FileMeta, Response, Source};
use crate::error::FastPathError;
use crate::range::{self, RangeStatus};
use crate::get_mime_type_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

pub struct FastRequest<'a> {
    pub method: Method,
    /// Raw request-target, query string and all, exactly as it appeared on
    /// the request line.
    pub raw_url: &'a str,
    pub if_modified_since: Option<SystemTime>,
    pub if_range: Option<SystemTime>,
    pub range_header: Option<&'a str>,
}

/// Strips the query string and fragment, then collapses `.` / `..`
/// segments against a virtual root — a traversal can pop back up to `/`
/// but never past it. Anything that isn't a `/`-delimited segment
/// (backslashes, percent-encoding, embedded NULs) is left untouched: this
/// operates on an already-decoded path, decoding is the server's job
/// upstream of this function.
pub fn sanitize_path(raw: &str) -> String {
    let without_fragment = raw.split('#').next().unwrap_or("");
    let without_query = without_fragment.split('?').next().unwrap_or("");

    let mut stack: Vec<&str> = Vec::new();
    for segment in without_query.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Maps sanitized URLs onto a document root, with a canonicalization check
/// as the final guard against escaping it (symlinks can reintroduce a `..`
/// that simple segment collapsing can't see) — the pattern used by
/// `proxy-src-static_files.rs` in the retrieval pack.
pub struct UrlMapper {
    doc_root: PathBuf,
    doc_root_canonical: PathBuf,
}

impl UrlMapper {
    pub fn new(doc_root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let doc_root = doc_root.into();
        let doc_root_canonical = doc_root.canonicalize()?;
        Ok(UrlMapper { doc_root, doc_root_canonical })
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    /// Resolves `raw_url` to a path under the document root, rejecting
    /// anything that would (even via symlinks) escape it.
    pub fn map(&self, raw_url: &str) -> Result<PathBuf, FastPathError> {
        let sanitized = sanitize_path(raw_url);
        let relative = sanitized.trim_start_matches('/');
        let candidate = if relative.is_empty() { self.doc_root.clone() } else { self.doc_root.join(relative) };

        let canonical = match candidate.canonicalize() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(FastPathError::NotFound),
            Err(e) => return Err(FastPathError::Io(e)),
        };

        if !canonical.starts_with(&self.doc_root_canonical) {
            return Err(FastPathError::PermissionDenied);
        }

        // Reject any remaining literal ".." component defensively — belt
        // and braces alongside the canonicalize check above.
        if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(FastPathError::PermissionDenied);
        }

        Ok(canonical)
    }
}

pub struct FastPath {
    mapper: UrlMapper,
    cache: Option<FileCache>,
    directory_index: Vec<String>,
    mmap_threshold: u64,
}

const DEFAULT_DIRECTORY_INDEX: &[&str] = &["index.html", "index.htm"];

impl FastPath {
    /// Builds a fast path for `server`'s `kiss` module section, reading
    /// `pageroot`, `directoryfile`, `cachemaxentry` and `cachemaxsize` —
    /// the same parameter names `NsConfigFastpath` reads, minus `mmap`
    /// (this crate decides per-request whether to map a file, see
    /// `deliver`, rather than taking a single global switch) — plus the
    /// global `ns/fastpath.cache` switch, read once here rather than
    /// per-server since it governs the whole process.
    pub fn new(config: &ConfigStore, server: &str) -> std::io::Result<Self> {
        let section = ConfigStore::config_path(server, "kiss", &[]);
        let page_root = config.get(&section, "pageroot").unwrap_or("./htdocs").to_string();
        let directory_index = config
            .get(&section, "directoryfile")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_else(|| DEFAULT_DIRECTORY_INDEX.iter().map(|s| s.to_string()).collect());
        let max_entries = config.get_int(&section, "cachemaxentry").unwrap_or(512).max(1) as usize;
        let max_total_bytes = config.get_int(&section, "cachemaxsize").unwrap_or(64 * 1024 * 1024).max(0) as u64;
        let mmap_threshold = config.get_int(&section, "mmapminsize").unwrap_or(16 * 1024).max(0) as u64;
        let cache_enabled = config.get_bool("ns/fastpath", "cache").unwrap_or(false);

        Ok(FastPath {
            mapper: UrlMapper::new(page_root)?,
            cache: cache_enabled.then(|| FileCache::new(max_entries, max_total_bytes, max_total_bytes / 4 + 1)),
            directory_index,
            mmap_threshold,
        })
    }

    /// `Ns_UrlIsFile`: true if `url` resolves to a regular file under the
    /// document root.
    pub fn url_is_file(&self, url: &str) -> bool {
        self.mapper.map(url).map(|p| p.is_file()).unwrap_or(false)
    }

    /// `Ns_UrlIsDir`: true if `url` resolves to a directory under the
    /// document root.
    pub fn url_is_dir(&self, url: &str) -> bool {
        self.mapper.map(url).map(|p| p.is_dir()).unwrap_or(false)
    }

    pub fn serve(&self, req: &FastRequest) -> Response {
        match self.resolve_and_build(req) {
            Ok(resp) => resp,
            Err(FastPathError::NotFound) | Err(FastPathError::PermissionDenied) => emitter::build_not_found(),
            Err(FastPathError::RangeNotSatisfiable { file_size }) => emitter::build_416(file_size),
            Err(FastPathError::Io(e)) => {
                log::warn!("fastpath: i/o error serving {}: {e}", req.raw_url);
                emitter::build_not_found()
            }
            Err(FastPathError::ShutdownPending) => emitter::build_not_found(),
        }
    }

    fn resolve_and_build(&self, req: &FastRequest) -> Result<Response, FastPathError> {
        let path = match self.mapper.map(req.raw_url) {
            Ok(p) => p,
            Err(e) => return Err(e),
        };

        if path.is_dir() {
            return self.serve_directory(req, &path);
        }

        self.serve_file(req, &path)
    }

    /// Mirrors `NsFastPathProc`'s directory handling: redirect to add a
    /// trailing slash if missing, otherwise look for the first matching
    /// index file and restart as a file request against it.
    fn serve_directory(&self, req: &FastRequest, dir: &Path) -> Result<Response, FastPathError> {
        if !req.raw_url.ends_with('/') {
            let sanitized = sanitize_path(req.raw_url);
            return Ok(emitter::build_redirect(&format!("{sanitized}/")));
        }

        for candidate in &self.directory_index {
            let index_path = dir.join(candidate);
            if index_path.is_file() {
                return self.serve_file(req, &index_path);
            }
        }

        Err(FastPathError::NotFound)
    }

    fn serve_file(&self, req: &FastRequest, path: &Path) -> Result<Response, FastPathError> {
        let metadata = std::fs::metadata(path)?;
        let mtime = metadata.modified()?;
        let size = metadata.len();

        if let Some(ims) = req.if_modified_since {
            if mtime <= ims {
                let meta = FileMeta { size, mtime: httpdate::HttpDate::from(mtime), content_type: mime_for(path) };
                return Ok(emitter::build_not_modified(&meta));
            }
        }

        let meta = FileMeta { size, mtime: httpdate::HttpDate::from(mtime), content_type: mime_for(path) };

        // HEAD always answers with the whole-file status and headers,
        // ignoring Range/If-Range entirely — the original returns before
        // ParseRange is ever called for a skip-body request.
        if req.method == Method::Head {
            let source = self.acquire_source(path, mtime, size)?;
            return Ok(emitter::build_whole(&meta, source, true));
        }

        let range_set = range::parse_range(req.range_header, req.if_range, size, mtime);
        if range_set.status == RangeStatus::Unsatisfiable {
            return Err(FastPathError::RangeNotSatisfiable { file_size: size });
        }

        let source = self.acquire_source(path, mtime, size)?;

        let response = match (range_set.status, range_set.offsets.len()) {
            (RangeStatus::None, _) | (_, 0) => emitter::build_whole(&meta, source, false),
            (RangeStatus::Ok, 1) => emitter::build_single_range(&meta, source, range_set.offsets[0], false),
            (RangeStatus::Ok, _) => emitter::build_multipart(&meta, source, &range_set.offsets, false),
            (RangeStatus::Unsatisfiable, _) => unreachable!("handled above"),
        };

        Ok(response)
    }

    /// When `ns/fastpath.cache` is off, every request takes the uncached
    /// path straight off disk. Otherwise, below `mmap_threshold`, reads the
    /// whole file through the cache (revalidating the cached copy's
    /// mtime/size against what we just stat'd, and retrying the build if
    /// it's stale); above it, hands the emitter a cloned file descriptor so
    /// large files stream straight off disk instead of copying through the
    /// cache.
    fn acquire_source(&self, path: &Path, mtime: SystemTime, size: u64) -> Result<Source, FastPathError> {
        let Some(cache) = &self.cache else {
            let file = std::fs::File::open(path)?;
            return Ok(Source::Channel(std::sync::Arc::new(file)));
        };

        if size > self.mmap_threshold {
            let file = std::fs::File::open(path)?;
            return Ok(Source::Channel(std::sync::Arc::new(file)));
        }

        let key = CacheKey::for_path(path).unwrap_or_else(|_| CacheKey::Path(path.to_path_buf()));
        cache.invalidate_if_stale(&key, mtime, size);

        let path_owned = path.to_path_buf();
        let entry = cache
            .lookup_or_build(key, move || {
                let bytes = std::fs::read(&path_owned)?;
                let meta = std::fs::metadata(&path_owned)?;
                Ok((meta.modified()?, meta.len(), bytes))
            })
            .map_err(FastPathError::Io)?;

        Ok(Source::Mapped(entry.bytes))
    }
}

pub fn mime_for(path: &Path) -> &'static str {
    get_mime_type_enum(path).as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn sanitize_collapses_parent_dir_segments() {
        assert_eq!(sanitize_path("/css/../style.css"), "/style.css");
        assert_eq!(sanitize_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(sanitize_path("/./a/./b"), "/a/b");
        assert_eq!(sanitize_path(""), "/");
        assert_eq!(sanitize_path("/"), "/");
    }

    #[test]
    fn sanitize_strips_query_and_fragment() {
        assert_eq!(sanitize_path("/style.css?v=1.2"), "/style.css");
        assert_eq!(sanitize_path("/page.html#section"), "/page.html");
        assert_eq!(sanitize_path("/app.js?v=1.0#main"), "/app.js");
    }

    #[test]
    fn sanitize_leaves_backslashes_and_percent_encoding_alone() {
        assert_eq!(sanitize_path("\\..\\..\\kiss"), "/\\..\\..\\kiss");
        assert_eq!(sanitize_path("/..%2F..%2Fkiss"), "/..%2F..%2Fkiss");
    }

    #[test]
    fn sanitize_preserves_embedded_nul() {
        assert_eq!(sanitize_path("/etc/passwd\0.txt"), "/etc/passwd\0.txt");
    }

    #[test]
    fn mapper_rejects_escape_above_root() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "a.txt", b"hi");
        let mapper = UrlMapper::new(tmp.path()).unwrap();
        assert!(mapper.map("/a.txt").is_ok());
        assert!(matches!(mapper.map("/../../../etc/passwd"), Err(FastPathError::NotFound) | Err(FastPathError::PermissionDenied)));
    }

    fn config_for(root: &Path) -> ConfigStore {
        let text = format!(
            "ns_section ns/server/default/module/kiss\nns_param pageroot {}\nns_param mmapminsize 1048576\n",
            root.display()
        );
        ConfigStore::parse(&text).unwrap()
    }

    #[test]
    fn whole_file_get() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"hello world");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/hello.txt",
            if_modified_since: None,
            if_range: None,
            range_header: None,
        };
        let resp = fp.serve(&req);
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn not_modified_on_matching_if_modified_since() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(tmp.path(), "hello.txt", b"hello world");
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/hello.txt",
            if_modified_since: Some(mtime),
            if_range: None,
            range_header: None,
        };
        assert_eq!(fp.serve(&req).status, 304);
    }

    #[test]
    fn single_range_returns_206() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"0123456789");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/hello.txt",
            if_modified_since: None,
            if_range: None,
            range_header: Some("bytes=2-4"),
        };
        assert_eq!(fp.serve(&req).status, 206);
    }

    #[test]
    fn head_ignores_out_of_range_header_and_returns_200() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"0123456789");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Head,
            raw_url: "/hello.txt",
            if_modified_since: None,
            if_range: None,
            range_header: Some("bytes=5000-"),
        };
        let resp = fp.serve(&req);
        assert_eq!(resp.status, 200);
        assert!(matches!(resp.body, emitter::ResponseBody::None));
    }

    #[test]
    fn head_ignores_satisfiable_range_header() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"0123456789");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Head,
            raw_url: "/hello.txt",
            if_modified_since: None,
            if_range: None,
            range_header: Some("bytes=2-4"),
        };
        assert_eq!(fp.serve(&req).status, 200);
    }

    #[test]
    fn cache_is_off_by_default() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"hello world");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        assert!(fp.cache.is_none());
    }

    #[test]
    fn ns_fastpath_cache_enables_the_cache() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"hello world");
        let text = format!(
            "ns_section ns/server/default/module/kiss\nns_param pageroot {}\nns_param mmapminsize 1048576\nns_section ns/fastpath\nns_param cache true\n",
            tmp.path().display()
        );
        let fp = FastPath::new(&ConfigStore::parse(&text).unwrap(), "default").unwrap();
        assert!(fp.cache.is_some());
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/hello.txt",
            if_modified_since: None,
            if_range: None,
            range_header: None,
        };
        assert_eq!(fp.serve(&req).status, 200);
        assert_eq!(fp.cache.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn unsatisfiable_range_returns_416() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "hello.txt", b"0123456789");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/hello.txt",
            if_modified_since: None,
            if_range: None,
            range_header: Some("bytes=5000-"),
        };
        assert_eq!(fp.serve(&req).status, 416);
    }

    #[test]
    fn missing_file_is_404() {
        let tmp = TempDir::new().unwrap();
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/nope.txt",
            if_modified_since: None,
            if_range: None,
            range_header: None,
        };
        assert_eq!(fp.serve(&req).status, 404);
    }

    #[test]
    fn directory_without_trailing_slash_redirects() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "sub/index.html", b"<html></html>");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/sub",
            if_modified_since: None,
            if_range: None,
            range_header: None,
        };
        assert_eq!(fp.serve(&req).status, 301);
    }

    #[test]
    fn directory_with_trailing_slash_serves_index() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "sub/index.html", b"<html></html>");
        let fp = FastPath::new(&config_for(tmp.path()), "default").unwrap();
        let req = FastRequest {
            method: Method::Get,
            raw_url: "/sub/",
            if_modified_since: None,
            if_range: None,
            range_header: None,
        };
        assert_eq!(fp.serve(&req).status, 200);
    }
}
