use std::path::PathBuf;
use std::sync::Arc;

/// Errors produced by the media cache engine.
///
/// The type is `Clone` so that a single transfer failure can be fanned out to
/// every subscriber attached to that download.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CacheError {
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Server returned status code {0}")]
    Status(u16),

    #[error("Transfer ended after {written} of {expected} bytes")]
    IncompleteBody { written: u64, expected: u64 },

    #[error("Invalid range: offset {offset}, length {length}")]
    InvalidRange { offset: u64, length: u64 },

    #[error("Offset {offset} is beyond the end of the resource ({total} bytes)")]
    OffsetBeyondEnd { offset: u64, total: u64 },

    #[error("Temporary file missing at move time: {}", .0.display())]
    MissingTempFile(PathBuf),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Refusing to cache an empty resource: {0}")]
    EmptyResource(String),

    #[error("Resource changed while it was being read")]
    ContentChanged,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,
}

// Manual implementation because of the Arc wrapping.
impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Http {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Persistence(err.to_string())
    }
}

impl CacheError {
    /// Whether the error belongs to the transient transport class.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CacheError::Http { .. } | CacheError::Status(_) | CacheError::IncompleteBody { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
