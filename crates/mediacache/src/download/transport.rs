//! Transport contract used by the download coordinator.
//!
//! A transport opens a byte stream for a URL, optionally continuing from an
//! opaque [`ResumeToken`] it produced earlier. The coordinator never looks
//! inside a token; it only stores it, persists it and hands it back.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use url::Url;

use crate::error::Result;

/// Opaque continuation state of a paused transfer
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

/// What the coordinator knows about a transfer at the moment it stops
#[derive(Debug, Clone, Default)]
pub struct TransferCheckpoint {
    /// Bytes written to the part file so far
    pub written: u64,
    /// Total length reported by the server, if any
    pub expected: Option<u64>,
    /// Entity validator (e.g. an ETag) of the first response
    pub validator: Option<String>,
    /// Whether the server advertised byte-range support
    pub accepts_ranges: bool,
}

/// An opened transfer
pub struct TransferResponse {
    /// Offset of the first byte yielded by `body`; 0 when the transfer restarted
    pub start_offset: u64,
    /// Total length of the resource, if known
    pub total_length: Option<u64>,
    pub content_type: Option<String>,
    pub validator: Option<String>,
    pub accepts_ranges: bool,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferResponse")
            .field("start_offset", &self.start_offset)
            .field("total_length", &self.total_length)
            .field("content_type", &self.content_type)
            .field("validator", &self.validator)
            .field("accepts_ranges", &self.accepts_ranges)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `url`, continuing from `resume` when given.
    ///
    /// A transport that cannot honor the token starts over and reports
    /// `start_offset == 0`.
    async fn open(&self, url: &Url, resume: Option<&ResumeToken>) -> Result<TransferResponse>;

    /// Produce a token for a stopped transfer, or `None` if it cannot be continued
    fn resume_token(&self, url: &Url, checkpoint: &TransferCheckpoint) -> Option<ResumeToken>;
}
