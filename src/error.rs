//! Error kinds shared by the fast path and the config loader.
//!
//! Most conditions here are routed straight to an HTTP status by the fast
//! path rather than propagated as a hard failure — see
//! `fastpath::FastPath::serve`.

use thiserror::Error;

/// Errors the static fast path can produce while resolving or delivering a
/// request. `NotFound` / `PermissionDenied` collapse to a 404 at the call
/// site; `RangeNotSatisfiable` carries the file size needed for the
/// `Content-Range: bytes */<size>` header of a 416 reply.
#[derive(Debug, Error)]
pub enum FastPathError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("range not satisfiable")]
    RangeNotSatisfiable { file_size: u64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socket reactor shutdown pending")]
    ShutdownPending,
}

/// Errors from loading the declarative `ns_section` / `ns_param` config
/// format (see `config::ConfigStore::load`).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: ns_param before any ns_section")]
    ParamWithoutSection { line: usize },

    #[error("line {line}: ns_section requires a section name")]
    SectionMissingName { line: usize },

    #[error("line {line}: ns_param requires a key and a value")]
    ParamMissingValue { line: usize },
}
