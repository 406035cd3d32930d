//! Scripted transport for coordinator and facade tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

use super::transport::{ResumeToken, TransferCheckpoint, TransferResponse, Transport};
use crate::error::{CacheError, Result};

/// Serves fixed bytes in fixed-size chunks.
///
/// With a gate, each chunk waits for one permit, so tests decide exactly when
/// bytes arrive. Tokens are the decimal offset to continue from.
pub(crate) struct ScriptedTransport {
    data: Bytes,
    validator: Option<String>,
    // Served from offset 0 by every open after the first
    replacement: Option<(Bytes, Option<String>)>,
    chunk_size: usize,
    resumable: bool,
    gate: Option<Arc<Semaphore>>,
    fail_at_chunk: Option<usize>,
    opens: AtomicUsize,
    offsets: Mutex<Vec<u64>>,
}

impl ScriptedTransport {
    pub fn new(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self {
            data: data.into(),
            validator: None,
            replacement: None,
            chunk_size,
            resumable: true,
            gate: None,
            fail_at_chunk: None,
            opens: AtomicUsize::new(0),
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn without_resume(mut self) -> Self {
        self.resumable = false;
        self
    }

    pub fn with_validator(mut self, validator: &str) -> Self {
        self.validator = Some(validator.to_string());
        self
    }

    /// Reopening ignores the token and serves `data` as a new entity
    pub fn replaced_on_reopen(mut self, data: impl Into<Bytes>, validator: &str) -> Self {
        self.replacement = Some((data.into(), Some(validator.to_string())));
        self
    }

    pub fn failing_at(mut self, chunk: usize) -> Self {
        self.fail_at_chunk = Some(chunk);
        self
    }

    /// Let `n` more chunks through the gate
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Number of physical transfers opened
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Start offset of every opened transfer
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _url: &Url, resume: Option<&ResumeToken>) -> Result<TransferResponse> {
        let reopened = self.opens.fetch_add(1, Ordering::SeqCst) > 0;
        let (data, validator, start) = match &self.replacement {
            Some((data, validator)) if reopened => (data.clone(), validator.clone(), 0),
            _ => {
                let start = match resume {
                    Some(token) if self.resumable => std::str::from_utf8(token.as_bytes())
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0),
                    _ => 0,
                };
                (self.data.clone(), self.validator.clone(), start)
            }
        };
        self.offsets.lock().push(start);

        let chunks: Vec<Bytes> = data[start as usize..]
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let gate = self.gate.clone();
        let fail_at = self.fail_at_chunk;

        let body = stream::iter(chunks.into_iter().enumerate())
            .then(move |(i, chunk)| {
                let gate = gate.clone();
                async move {
                    if let Some(gate) = gate {
                        if let Ok(permit) = gate.acquire().await {
                            permit.forget();
                        }
                    }
                    if fail_at == Some(i) {
                        Err(CacheError::Status(503))
                    } else {
                        Ok(chunk)
                    }
                }
            })
            .boxed();

        Ok(TransferResponse {
            start_offset: start,
            total_length: Some(data.len() as u64),
            content_type: Some("video/mp4".to_string()),
            validator,
            accepts_ranges: self.resumable,
            body,
        })
    }

    fn resume_token(&self, _url: &Url, checkpoint: &TransferCheckpoint) -> Option<ResumeToken> {
        if self.resumable && checkpoint.written > 0 {
            Some(ResumeToken::new(checkpoint.written.to_string()))
        } else {
            None
        }
    }
}
