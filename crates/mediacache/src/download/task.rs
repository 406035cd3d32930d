//! Per-resource download task and its subscriber fan-out.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::transport::{ResumeToken, TransferCheckpoint};
use crate::error::{CacheError, Result};
use crate::resource::{CacheTier, ResourceKind};
use crate::stream::StreamFulfillmentEngine;

/// Lifecycle of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    None,
    Downloading,
    Paused,
    Finished,
    Cancelled,
}

/// What to download and where the result should live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Url,
    pub kind: ResourceKind,
    pub tier: CacheTier,
}

impl DownloadRequest {
    pub fn new(url: Url, kind: ResourceKind, tier: CacheTier) -> Self {
        Self { url, kind, tier }
    }
}

/// Notification fanned out to every subscriber of a task
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// The transfer opened; `expected` is the total length if the server sent one
    Started { expected: Option<u64> },
    Progress {
        written: u64,
        expected: Option<u64>,
        fraction: Option<f64>,
    },
    /// Progress went back to zero because the transfer could not be continued
    Reset,
    Paused { resumable: bool },
    /// The resource is cached; `path` is `None` for memory-tier results
    Finished { path: Option<PathBuf>, size: u64 },
    Failed(CacheError),
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadEvent::Finished { .. } | DownloadEvent::Failed(_))
    }
}

/// Receiving end of a task's event fan-out.
///
/// Dropping it detaches the subscriber without affecting the transfer.
#[derive(Debug)]
pub struct DownloadSubscription {
    url: Url,
    rx: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl DownloadSubscription {
    pub(crate) fn new(url: Url) -> (mpsc::UnboundedSender<DownloadEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { url, rx })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Next event; `None` once the task is gone (e.g. cancelled)
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DownloadEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the terminal event, discarding progress.
    ///
    /// Returns the final size in bytes.
    pub async fn wait(mut self) -> Result<u64> {
        while let Some(event) = self.rx.recv().await {
            match event {
                DownloadEvent::Finished { size, .. } => return Ok(size),
                DownloadEvent::Failed(e) => return Err(e),
                _ => {}
            }
        }
        Err(CacheError::Cancelled)
    }
}

/// Why the transfer loop was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Pause,
    Cancel,
}

pub(crate) struct TaskInner {
    pub state: DownloadState,
    pub written: u64,
    pub expected: Option<u64>,
    pub validator: Option<String>,
    pub accepts_ranges: bool,
    pub resume_token: Option<ResumeToken>,
    pub cancel: Option<CancellationToken>,
    pub handle: Option<JoinHandle<()>>,
    pub stop: Option<StopReason>,
    subscribers: Vec<mpsc::UnboundedSender<DownloadEvent>>,
    // Replayed to anyone subscribing after the task ended
    terminal: Option<DownloadEvent>,
}

impl TaskInner {
    pub fn checkpoint(&self) -> TransferCheckpoint {
        TransferCheckpoint {
            written: self.written,
            expected: self.expected,
            validator: self.validator.clone(),
            accepts_ranges: self.accepts_ranges,
        }
    }

    pub fn drop_subscribers(&mut self) {
        self.subscribers.clear();
    }
}

/// One physical download, shared by every consumer of the same URL
pub struct DownloadTask {
    request: DownloadRequest,
    inner: Mutex<TaskInner>,
    stream: Arc<StreamFulfillmentEngine>,
}

impl DownloadTask {
    pub(crate) fn new(request: DownloadRequest) -> Self {
        Self {
            request,
            inner: Mutex::new(TaskInner {
                state: DownloadState::None,
                written: 0,
                expected: None,
                validator: None,
                accepts_ranges: false,
                resume_token: None,
                cancel: None,
                handle: None,
                stop: None,
                subscribers: Vec::new(),
                terminal: None,
            }),
            stream: Arc::new(StreamFulfillmentEngine::streaming()),
        }
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    pub fn state(&self) -> DownloadState {
        self.inner.lock().state
    }

    pub fn written(&self) -> u64 {
        self.inner.lock().written
    }

    pub fn expected(&self) -> Option<u64> {
        self.inner.lock().expected
    }

    pub fn progress(&self) -> Option<f64> {
        let inner = self.inner.lock();
        progress_fraction(inner.written, inner.expected)
    }

    /// Bytes of this transfer as they arrive, for range reads
    pub fn stream(&self) -> &Arc<StreamFulfillmentEngine> {
        &self.stream
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner.lock()
    }

    /// Attach a subscriber. A task that already finished or failed hands the
    /// new subscriber its terminal event straight away; a cancelled task
    /// closes the subscription at once.
    pub(crate) fn subscribe(&self) -> DownloadSubscription {
        let (tx, subscription) = DownloadSubscription::new(self.request.url.clone());
        let mut inner = self.inner.lock();
        match &inner.terminal {
            Some(event) => {
                let _ = tx.send(event.clone());
            }
            None if inner.state == DownloadState::Cancelled => {}
            None => inner.subscribers.push(tx),
        }
        subscription
    }

    /// Send `event` to every subscriber still listening
    pub(crate) fn emit(&self, event: DownloadEvent) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if event.is_terminal() {
            inner.subscribers.clear();
            inner.terminal = Some(event);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// `written / expected`, or `None` when the total is unknown or zero
pub fn progress_fraction(written: u64, expected: Option<u64>) -> Option<f64> {
    match expected {
        Some(expected) if expected > 0 => Some((written as f64 / expected as f64).min(1.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        DownloadTask::new(DownloadRequest::new(
            Url::parse("https://x/a.mp4").unwrap(),
            ResourceKind::Video,
            CacheTier::Disk,
        ))
    }

    #[test]
    fn test_progress_fraction_guards_unknown_total() {
        assert_eq!(progress_fraction(10, None), None);
        assert_eq!(progress_fraction(10, Some(0)), None);
        assert_eq!(progress_fraction(250, Some(1000)), Some(0.25));
        assert_eq!(progress_fraction(2000, Some(1000)), Some(1.0));
    }

    #[tokio::test]
    async fn test_events_fan_out_to_every_subscriber() {
        let task = task();
        let mut a = task.subscribe();
        let mut b = task.subscribe();

        task.emit(DownloadEvent::Started { expected: Some(3) });
        assert!(matches!(a.recv().await, Some(DownloadEvent::Started { expected: Some(3) })));
        assert!(matches!(b.recv().await, Some(DownloadEvent::Started { expected: Some(3) })));
    }

    #[tokio::test]
    async fn test_detached_subscriber_is_pruned() {
        let task = task();
        let a = task.subscribe();
        let mut b = task.subscribe();
        drop(a);

        task.emit(DownloadEvent::Reset);
        assert_eq!(task.subscriber_count(), 1);
        assert!(matches!(b.recv().await, Some(DownloadEvent::Reset)));
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_event() {
        let finished = task();
        let sub = finished.subscribe();
        finished.emit(DownloadEvent::Progress {
            written: 1,
            expected: Some(2),
            fraction: Some(0.5),
        });
        finished.emit(DownloadEvent::Finished { path: None, size: 2 });
        assert_eq!(sub.wait().await.unwrap(), 2);
        assert_eq!(finished.subscriber_count(), 0);

        let dropped = task();
        let sub = dropped.subscribe();
        dropped.lock().drop_subscribers();
        assert!(matches!(sub.wait().await, Err(CacheError::Cancelled)));
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_terminal_event() {
        let finished = task();
        finished.emit(DownloadEvent::Finished { path: None, size: 7 });
        assert_eq!(finished.subscribe().wait().await.unwrap(), 7);

        let failed = task();
        failed.emit(DownloadEvent::Failed(CacheError::Status(404)));
        assert!(matches!(failed.subscribe().wait().await, Err(CacheError::Status(404))));

        let cancelled = task();
        cancelled.lock().state = DownloadState::Cancelled;
        assert!(matches!(cancelled.subscribe().wait().await, Err(CacheError::Cancelled)));
    }
}
