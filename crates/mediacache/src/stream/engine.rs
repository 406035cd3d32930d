//! # Stream Fulfillment Engine
//!
//! Matches an append-only byte buffer against outstanding range reads.
//!
//! Reads are pulled in with [`StreamFulfillmentEngine::submit_reads`] and
//! bytes are pushed in with [`StreamFulfillmentEngine::on_bytes_appended`];
//! both trigger a fulfillment pass. Each pass delivers, per pending read, only
//! the slice that became available since the previous pass, so the work done
//! under the lock is proportional to the pending reads and the bytes handed
//! out, never to the size of the buffer.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{CacheError, Result};

pub type ReadId = u64;

/// Content metadata supplied to a requester before any bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentInfo {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

impl ContentInfo {
    pub fn new(content_type: Option<String>, content_length: Option<u64>) -> Self {
        Self {
            content_type,
            content_length,
        }
    }

    fn is_known(&self) -> bool {
        self.content_type.is_some() || self.content_length.is_some()
    }
}

/// A byte range requested by a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: u64,
    pub length: u64,
}

impl ReadRequest {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Event delivered to the holder of a [`ReadHandle`]
#[derive(Debug, Clone)]
pub enum ReadEvent {
    /// Content type and total length, sent once when known
    ContentInfo(ContentInfo),
    /// A contiguous slice of the requested range
    Data { offset: u64, bytes: Bytes },
    /// The read is fully satisfied; no more events follow
    Complete,
    /// The read can never be satisfied; no more events follow
    Failed(CacheError),
}

/// Bytes and metadata that were already available when drained
#[derive(Debug, Clone, Default)]
pub struct ReadyData {
    pub info: Option<ContentInfo>,
    pub data: Bytes,
    pub complete: bool,
}

/// Consumer side of a pending read
#[derive(Debug)]
pub struct ReadHandle {
    id: ReadId,
    request: ReadRequest,
    rx: mpsc::UnboundedReceiver<ReadEvent>,
}

impl ReadHandle {
    pub fn id(&self) -> ReadId {
        self.id
    }

    pub fn request(&self) -> ReadRequest {
        self.request
    }

    /// Wait for the next event. `None` means the source went away.
    pub async fn recv(&mut self) -> Option<ReadEvent> {
        self.rx.recv().await
    }

    /// Drain every event that is already queued without waiting.
    pub fn take_ready(&mut self) -> Result<ReadyData> {
        let mut ready = ReadyData::default();
        let mut data = BytesMut::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                ReadEvent::ContentInfo(info) => ready.info = Some(info),
                ReadEvent::Data { bytes, .. } => data.extend_from_slice(&bytes),
                ReadEvent::Complete => {
                    ready.complete = true;
                    break;
                }
                ReadEvent::Failed(e) => return Err(e),
            }
        }
        ready.data = data.freeze();
        Ok(ready)
    }

    /// Collect every delivered byte until the read completes.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut data = BytesMut::with_capacity(self.request.length.min(1 << 20) as usize);
        while let Some(event) = self.rx.recv().await {
            match event {
                ReadEvent::ContentInfo(_) => {}
                ReadEvent::Data { bytes, .. } => data.extend_from_slice(&bytes),
                ReadEvent::Complete => return Ok(data.freeze()),
                ReadEvent::Failed(e) => return Err(e),
            }
        }
        Err(CacheError::Cancelled)
    }
}

struct PendingRead {
    id: ReadId,
    request: ReadRequest,
    delivered: u64,
    info_sent: bool,
    tx: mpsc::UnboundedSender<ReadEvent>,
}

#[derive(Debug, Clone)]
enum SourceStatus {
    Streaming,
    Finished,
    Failed(CacheError),
}

struct EngineState {
    buffer: BytesMut,
    info: ContentInfo,
    pending: Vec<PendingRead>,
    status: SourceStatus,
}

enum Progress {
    Pending,
    Done,
}

impl EngineState {
    fn service(&self, read: &mut PendingRead) -> Progress {
        if read.tx.is_closed() {
            // Consumer detached
            return Progress::Done;
        }

        if !read.info_sent && self.info.is_known() {
            let _ = read.tx.send(ReadEvent::ContentInfo(self.info.clone()));
            read.info_sent = true;
        }

        if read.request.length == 0 {
            let _ = read.tx.send(ReadEvent::Complete);
            return Progress::Done;
        }

        if let Some(total) = self.info.content_length {
            if read.request.offset >= total {
                let _ = read.tx.send(ReadEvent::Failed(CacheError::OffsetBeyondEnd {
                    offset: read.request.offset,
                    total,
                }));
                return Progress::Done;
            }
        }

        let buffered = self.buffer.len() as u64;
        let start = read.request.offset + read.delivered;
        if buffered > start {
            let end = buffered.min(read.request.end());
            if end > start {
                let bytes = Bytes::copy_from_slice(&self.buffer[start as usize..end as usize]);
                let _ = read.tx.send(ReadEvent::Data {
                    offset: start,
                    bytes,
                });
                read.delivered = end - read.request.offset;
            }
        }

        if buffered >= read.request.end() {
            let _ = read.tx.send(ReadEvent::Complete);
            return Progress::Done;
        }

        match &self.status {
            SourceStatus::Streaming => Progress::Pending,
            SourceStatus::Finished => {
                // End of data: reads overlapping the end complete short.
                if read.request.offset < buffered {
                    let _ = read.tx.send(ReadEvent::Complete);
                } else {
                    let _ = read.tx.send(ReadEvent::Failed(CacheError::OffsetBeyondEnd {
                        offset: read.request.offset,
                        total: buffered,
                    }));
                }
                Progress::Done
            }
            SourceStatus::Failed(e) => {
                let _ = read.tx.send(ReadEvent::Failed(e.clone()));
                Progress::Done
            }
        }
    }

    fn fulfill(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.retain_mut(|read| match self.service(read) {
            Progress::Pending => true,
            Progress::Done => {
                trace!(read = read.id, delivered = read.delivered, "Read finished");
                false
            }
        });
        self.pending = pending;
    }
}

/// Reconciles a growing buffer with the reads waiting on it.
pub struct StreamFulfillmentEngine {
    state: Mutex<EngineState>,
    next_id: AtomicU64,
}

impl StreamFulfillmentEngine {
    /// Engine for a resource whose bytes are still arriving
    pub fn streaming() -> Self {
        Self::with_state(EngineState {
            buffer: BytesMut::new(),
            info: ContentInfo::default(),
            pending: Vec::new(),
            status: SourceStatus::Streaming,
        })
    }

    /// Engine over fixed in-memory bytes; content info is known immediately
    pub fn from_bytes(bytes: Bytes, content_type: impl Into<String>) -> Self {
        let len = bytes.len() as u64;
        Self::with_state(EngineState {
            buffer: BytesMut::from(bytes),
            info: ContentInfo::new(Some(content_type.into()), Some(len)),
            pending: Vec::new(),
            status: SourceStatus::Finished,
        })
    }

    fn with_state(state: EngineState) -> Self {
        Self {
            state: Mutex::new(state),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register reads and immediately serve whatever is already buffered
    pub fn submit_reads(&self, reads: impl IntoIterator<Item = ReadRequest>) -> Vec<ReadHandle> {
        let mut state = self.state.lock();
        let mut handles = Vec::new();
        for request in reads {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::unbounded_channel();
            state.pending.push(PendingRead {
                id,
                request,
                delivered: 0,
                info_sent: false,
                tx,
            });
            handles.push(ReadHandle { id, request, rx });
        }
        state.fulfill();
        handles
    }

    /// Convenience for a single read
    pub fn submit_read(&self, request: ReadRequest) -> ReadHandle {
        let mut handles = self.submit_reads([request]);
        // submit_reads returns exactly one handle per request
        handles.remove(0)
    }

    /// Withdraw a pending read. Returns whether it was still pending.
    pub fn cancel_read(&self, id: ReadId) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|read| read.id != id);
        before != state.pending.len()
    }

    /// Record response metadata; only the first value seen for each field is kept
    pub fn on_response(&self, info: ContentInfo) {
        let mut state = self.state.lock();
        if state.info.content_type.is_none() {
            state.info.content_type = info.content_type;
        }
        if state.info.content_length.is_none() {
            state.info.content_length = info.content_length;
        }
        state.fulfill();
    }

    /// Append a chunk and serve every read it unblocks
    pub fn on_bytes_appended(&self, chunk: &[u8]) {
        let mut state = self.state.lock();
        state.buffer.extend_from_slice(chunk);
        state.fulfill();
    }

    /// Append a chunk that starts at `offset` of the resource.
    ///
    /// Bytes already buffered are skipped, which keeps the buffer append-only
    /// when a transfer restarts from an earlier position. Returns the number
    /// of bytes actually appended.
    pub fn append_at(&self, offset: u64, chunk: &[u8]) -> usize {
        let mut state = self.state.lock();
        let buffered = state.buffer.len() as u64;
        let end = offset + chunk.len() as u64;
        if end <= buffered {
            return 0;
        }
        if offset > buffered {
            warn!(offset, buffered, "Chunk leaves a gap in the stream buffer, ignoring it");
            return 0;
        }
        let skip = (buffered - offset) as usize;
        state.buffer.extend_from_slice(&chunk[skip..]);
        state.fulfill();
        chunk.len() - skip
    }

    /// Drop everything buffered because the source is starting over with
    /// content that may differ.
    ///
    /// Reads that already received bytes fail with
    /// [`CacheError::ContentChanged`]; the others stay pending and are served
    /// from the new content, including its content info.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        let discarded = state.buffer.len();
        state.buffer.clear();
        state.info = ContentInfo::default();
        state.status = SourceStatus::Streaming;
        state.pending.retain_mut(|read| {
            if read.delivered > 0 {
                let _ = read.tx.send(ReadEvent::Failed(CacheError::ContentChanged));
                return false;
            }
            read.info_sent = false;
            true
        });
        debug!(discarded, pending = state.pending.len(), "Stream restarted");
    }

    /// Mark the source complete; pending reads are answered against the final size
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.info.content_length.is_none() {
            state.info.content_length = Some(state.buffer.len() as u64);
        }
        state.status = SourceStatus::Finished;
        debug!(len = state.buffer.len(), pending = state.pending.len(), "Stream finished");
        state.fulfill();
    }

    /// Mark the source failed; every pending read receives the error
    pub fn fail(&self, error: CacheError) {
        let mut state = self.state.lock();
        state.status = SourceStatus::Failed(error);
        state.fulfill();
    }

    pub fn buffered_len(&self) -> u64 {
        self.state.lock().buffer.len() as u64
    }

    pub fn content_info(&self) -> ContentInfo {
        self.state.lock().info.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state.lock().status, SourceStatus::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(handle: &mut ReadHandle) -> (Vec<u8>, bool) {
        let ready = handle.take_ready().unwrap();
        (ready.data.to_vec(), ready.complete)
    }

    fn source(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_partial_fulfillment_monotonicity() {
        let data = source(300);
        for chunk_size in [1usize, 3, 7, 50, 104, 105, 300] {
            for final_len in [0usize, 4, 5, 6, 104, 105, 150, 300] {
                let engine = StreamFulfillmentEngine::streaming();
                let mut handle = engine.submit_read(ReadRequest::new(5, 100));
                let mut delivered = Vec::new();
                let mut complete = false;

                for chunk in data[..final_len].chunks(chunk_size) {
                    engine.on_bytes_appended(chunk);
                    let (bytes, done) = drain(&mut handle);
                    delivered.extend(bytes);
                    complete |= done;
                }

                let expected = 100usize.min(final_len.saturating_sub(5));
                assert_eq!(delivered.len(), expected, "chunk {chunk_size}, len {final_len}");
                assert_eq!(&delivered[..], &data[5..5 + expected]);
                assert_eq!(complete, final_len >= 105, "chunk {chunk_size}, len {final_len}");
                assert_eq!(engine.pending_count(), usize::from(final_len < 105));
            }
        }
    }

    #[test]
    fn test_read_after_bytes_buffered_is_served_immediately() {
        let engine = StreamFulfillmentEngine::streaming();
        engine.on_bytes_appended(&source(50));

        let mut handle = engine.submit_read(ReadRequest::new(10, 20));
        let (bytes, complete) = drain(&mut handle);
        assert_eq!(bytes, source(50)[10..30].to_vec());
        assert!(complete);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_read_beyond_buffer_stays_pending() {
        let engine = StreamFulfillmentEngine::streaming();
        engine.on_bytes_appended(&source(10));

        let mut handle = engine.submit_read(ReadRequest::new(10, 5));
        let (bytes, complete) = drain(&mut handle);
        assert!(bytes.is_empty());
        assert!(!complete);
        assert_eq!(engine.pending_count(), 1);

        engine.on_bytes_appended(&source(5));
        let (bytes, complete) = drain(&mut handle);
        assert_eq!(bytes.len(), 5);
        assert!(complete);
    }

    #[test]
    fn test_zero_length_read_completes_immediately() {
        let engine = StreamFulfillmentEngine::streaming();
        let mut handle = engine.submit_read(ReadRequest::new(1_000, 0));
        let (bytes, complete) = drain(&mut handle);
        assert!(bytes.is_empty());
        assert!(complete);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_offset_beyond_known_total_is_rejected() {
        let engine = StreamFulfillmentEngine::streaming();
        engine.on_response(ContentInfo::new(Some("video/mp4".into()), Some(100)));

        let mut handle = engine.submit_read(ReadRequest::new(100, 10));
        assert!(matches!(
            handle.take_ready(),
            Err(CacheError::OffsetBeyondEnd { offset: 100, total: 100 })
        ));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_content_info_precedes_data() {
        let engine = StreamFulfillmentEngine::streaming();
        let mut handle = engine.submit_read(ReadRequest::new(0, 4));
        assert!(handle.rx.try_recv().is_err());

        engine.on_response(ContentInfo::new(Some("video/mp4".into()), Some(4)));
        engine.on_bytes_appended(b"abcd");

        match handle.rx.try_recv().unwrap() {
            ReadEvent::ContentInfo(info) => {
                assert_eq!(info.content_type.as_deref(), Some("video/mp4"));
                assert_eq!(info.content_length, Some(4));
            }
            other => panic!("expected content info first, got {other:?}"),
        }
        assert!(matches!(handle.rx.try_recv().unwrap(), ReadEvent::Data { offset: 0, .. }));
        assert!(matches!(handle.rx.try_recv().unwrap(), ReadEvent::Complete));
    }

    #[test]
    fn test_first_response_metadata_wins() {
        let engine = StreamFulfillmentEngine::streaming();
        engine.on_response(ContentInfo::new(Some("video/mp4".into()), None));
        engine.on_response(ContentInfo::new(Some("text/html".into()), Some(42)));
        let info = engine.content_info();
        assert_eq!(info.content_type.as_deref(), Some("video/mp4"));
        assert_eq!(info.content_length, Some(42));
    }

    #[test]
    fn test_cancel_read_removes_it_without_side_effects() {
        let engine = StreamFulfillmentEngine::streaming();
        let mut a = engine.submit_read(ReadRequest::new(0, 10));
        let mut b = engine.submit_read(ReadRequest::new(0, 10));

        assert!(engine.cancel_read(a.id()));
        assert!(!engine.cancel_read(a.id()));
        engine.on_bytes_appended(&source(10));

        assert_eq!(drain(&mut b), (source(10), true));
        // The cancelled read gets nothing and its channel is closed
        assert!(a.take_ready().unwrap().data.is_empty());
    }

    #[test]
    fn test_fixed_bytes_source() {
        let engine = StreamFulfillmentEngine::from_bytes(Bytes::from(source(64)), "image/png");
        let mut handles = engine.submit_reads([ReadRequest::new(0, 16), ReadRequest::new(60, 16)]);

        let first = handles[0].take_ready().unwrap();
        assert_eq!(first.info.unwrap().content_length, Some(64));
        assert_eq!(first.data.len(), 16);
        assert!(first.complete);

        // Overlaps the end of a finished source: completes short
        let second = handles[1].take_ready().unwrap();
        assert_eq!(second.data.to_vec(), source(64)[60..].to_vec());
        assert!(second.complete);
    }

    #[test]
    fn test_finish_and_fail_resolve_pending_reads() {
        let engine = StreamFulfillmentEngine::streaming();
        let mut short = engine.submit_read(ReadRequest::new(0, 100));
        let mut past = engine.submit_read(ReadRequest::new(50, 10));
        engine.on_bytes_appended(&source(20));
        engine.finish();
        assert!(engine.is_finished());
        assert_eq!(engine.content_info().content_length, Some(20));

        assert_eq!(drain(&mut short), (source(20), true));
        assert!(matches!(
            past.take_ready(),
            Err(CacheError::OffsetBeyondEnd { offset: 50, total: 20 })
        ));

        let failing = StreamFulfillmentEngine::streaming();
        let mut handle = failing.submit_read(ReadRequest::new(0, 10));
        failing.fail(CacheError::Status(503));
        assert!(matches!(handle.take_ready(), Err(CacheError::Status(503))));
    }

    #[test]
    fn test_append_at_skips_duplicate_bytes() {
        let engine = StreamFulfillmentEngine::streaming();
        let data = source(30);
        assert_eq!(engine.append_at(0, &data[..20]), 20);
        // Restarted transfer replays the first 20 bytes
        assert_eq!(engine.append_at(0, &data[..10]), 0);
        assert_eq!(engine.append_at(10, &data[10..25]), 5);
        assert_eq!(engine.append_at(40, &data[..5]), 0);
        assert_eq!(engine.buffered_len(), 25);

        let handle = engine.submit_read(ReadRequest::new(0, 25));
        let mut handle = handle;
        assert_eq!(drain(&mut handle), (data[..25].to_vec(), true));
    }

    #[test]
    fn test_restart_fails_started_reads_and_serves_waiting_ones() {
        let engine = StreamFulfillmentEngine::streaming();
        engine.on_response(ContentInfo::new(Some("video/mp4".into()), Some(100)));
        let mut started = engine.submit_read(ReadRequest::new(0, 50));
        engine.on_bytes_appended(&[1u8; 20]);
        let mut waiting = engine.submit_read(ReadRequest::new(40, 10));
        assert_eq!(drain(&mut started).0.len(), 20);
        waiting.take_ready().unwrap();

        engine.restart();
        assert_eq!(engine.buffered_len(), 0);
        assert_eq!(engine.content_info(), ContentInfo::default());
        assert!(matches!(started.take_ready(), Err(CacheError::ContentChanged)));
        assert_eq!(engine.pending_count(), 1);

        // The replacement content is appended from the start again
        engine.on_response(ContentInfo::new(Some("video/mp4".into()), Some(60)));
        assert_eq!(engine.append_at(0, &[2u8; 60]), 60);
        let ready = waiting.take_ready().unwrap();
        assert_eq!(ready.info.unwrap().content_length, Some(60));
        assert_eq!(ready.data.to_vec(), vec![2u8; 10]);
        assert!(ready.complete);
    }

    #[test]
    fn test_detached_consumer_is_dropped() {
        let engine = StreamFulfillmentEngine::streaming();
        let handle = engine.submit_read(ReadRequest::new(0, 10));
        drop(handle);
        engine.on_bytes_appended(b"x");
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_read_to_end_across_chunks() {
        let engine = std::sync::Arc::new(StreamFulfillmentEngine::streaming());
        let handle = engine.submit_read(ReadRequest::new(0, 3000));

        let feeder = engine.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                feeder.on_bytes_appended(&[1u8; 1000]);
                tokio::task::yield_now().await;
            }
        });

        let bytes = handle.read_to_end().await.unwrap();
        assert_eq!(bytes.len(), 3000);
    }
}
