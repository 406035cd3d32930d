//! # Download Coordinator
//!
//! Owns at most one transfer per URL. The task table is keyed by the URL
//! string; a second `start` for a URL that already has a task subscribes to
//! that task instead of opening another transfer.
//!
//! Each transfer runs on its own tokio task:
//!
//! ```text
//! open -> write chunk to <hash>.part -> feed stream engine -> fan out progress
//!      -> stage (<hash>.<ext>) -> transform -> move into place -> index
//! ```
//!
//! Pause and cancel are cooperative: the transfer loop selects on a
//! [`CancellationToken`] next to the body stream. A paused transfer asks the
//! transport for a resume token and persists it, together with the byte
//! count, in the key-value substrate under `resume:<url path>` so it can be
//! continued after a restart.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::task::{
    DownloadEvent, DownloadRequest, DownloadState, DownloadSubscription, DownloadTask, StopReason,
    progress_fraction,
};
use super::transform::ResourceTransform;
use super::transport::{ResumeToken, TransferCheckpoint, Transport};
use crate::error::{CacheError, Result};
use crate::index::ResourceIndex;
use crate::memory::TieredMemoryCache;
use crate::resource::{CacheTier, ResourceIdentity, ResourceKind, guess_content_type};
use crate::storage::{FileStore, KeyValueStore, remove_quietly};
use crate::stream::ContentInfo;

const RESUME_PREFIX: &str = "resume:";

/// Key of the persisted resume record of `url`
pub fn resume_key(url: &Url) -> String {
    format!("{RESUME_PREFIX}{}", url.path())
}

/// Persisted state of a paused or in-flight transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub url: String,
    pub kind: ResourceKind,
    pub tier: CacheTier,
    pub written: u64,
    pub expected: Option<u64>,
    /// Hex-encoded resume token, if the transport produced one
    pub token: Option<String>,
    /// Entity validator of the content written so far
    #[serde(default)]
    pub validator: Option<String>,
}

impl ResumeRecord {
    fn token(&self) -> Option<ResumeToken> {
        let hex = self.token.as_deref()?;
        match hex::decode(hex) {
            Ok(bytes) => Some(ResumeToken::new(bytes)),
            Err(e) => {
                warn!(url = %self.url, error = %e, "Discarding malformed resume token");
                None
            }
        }
    }
}

enum Outcome {
    Completed { path: Option<PathBuf>, size: u64 },
    Stopped,
}

enum Slot {
    Existing(Arc<DownloadTask>),
    Created(Arc<DownloadTask>, Option<DownloadSubscription>),
}

struct CoordinatorInner {
    tasks: Mutex<HashMap<String, Arc<DownloadTask>>>,
    transport: Arc<dyn Transport>,
    transform: Arc<dyn ResourceTransform>,
    files: Arc<FileStore>,
    index: Arc<ResourceIndex>,
    memory: Arc<TieredMemoryCache<Bytes>>,
    kv: Arc<dyn KeyValueStore>,
}

/// Keyed table of active downloads
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DownloadCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        transform: Arc<dyn ResourceTransform>,
        files: Arc<FileStore>,
        index: Arc<ResourceIndex>,
        memory: Arc<TieredMemoryCache<Bytes>>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                tasks: Mutex::new(HashMap::new()),
                transport,
                transform,
                files,
                index,
                memory,
                kv,
            }),
        }
    }

    /// The active task for `url`, if any
    pub fn task(&self, url: &Url) -> Option<Arc<DownloadTask>> {
        self.inner.tasks.lock().get(url.as_str()).cloned()
    }

    pub fn state(&self, url: &Url) -> Option<DownloadState> {
        self.task(url).map(|task| task.state())
    }

    /// Fraction of the active transfer already written; `None` if there is
    /// no task or its total length is unknown
    pub fn progress(&self, url: &Url) -> Option<f64> {
        self.task(url).and_then(|task| task.progress())
    }

    pub fn active_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Persisted resume state of `url`, if a paused transfer left one
    pub async fn resume_record(&self, url: &Url) -> Option<ResumeRecord> {
        self.inner.load_record(url).await
    }

    /// Snapshot of every active task
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.inner.tasks.lock().values().cloned().collect()
    }

    /// Cancel every active or paused transfer, optionally only those of `kind`.
    ///
    /// Returns how many were cancelled.
    pub async fn cancel_all(&self, kind: Option<ResourceKind>) -> usize {
        let matches = |k: ResourceKind| kind.is_none_or(|wanted| wanted == k);

        let mut urls: Vec<Url> = self
            .tasks()
            .into_iter()
            .filter(|task| matches(task.request().kind))
            .map(|task| task.url().clone())
            .collect();

        match self.inner.kv.keys(RESUME_PREFIX).await {
            Ok(keys) => {
                for key in keys {
                    let Some(record) = self.inner.load_record_by_key(&key).await else {
                        continue;
                    };
                    if !matches(record.kind) {
                        continue;
                    }
                    match Url::parse(&record.url) {
                        Ok(url) => urls.push(url),
                        Err(e) => warn!(key, error = %e, "Resume record holds an invalid URL"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list resume records"),
        }

        urls.sort();
        urls.dedup();

        let mut cancelled = 0;
        for url in urls {
            if self.cancel(&url).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Start or join the download of `request.url`.
    ///
    /// An existing task gains a subscriber and is resumed if paused. A
    /// resource that is already cached completes immediately without a task.
    #[instrument(skip(self), fields(url = %request.url), level = "debug")]
    pub async fn start(&self, request: DownloadRequest) -> Result<DownloadSubscription> {
        if let Some(task) = self.task(&request.url) {
            return self.attach(task).await;
        }

        if let Some(event) = self.inner.cached_completion(&request).await {
            debug!(url = %request.url, "Already cached");
            let (tx, subscription) = DownloadSubscription::new(request.url.clone());
            let _ = tx.send(event);
            return Ok(subscription);
        }

        let record = self.inner.load_record(&request.url).await;
        let slot = self.inner.get_or_insert(request, true);
        match slot {
            Slot::Existing(task) => self.attach(task).await,
            Slot::Created(task, subscription) => {
                if let Some(record) = record {
                    restore_record(&task, record);
                }
                self.inner.spawn(&task);
                subscription.ok_or(CacheError::Cancelled)
            }
        }
    }

    async fn attach(&self, task: Arc<DownloadTask>) -> Result<DownloadSubscription> {
        let subscription = task.subscribe();
        if task.state() == DownloadState::Paused {
            self.resume(task.url()).await?;
        }
        Ok(subscription)
    }

    /// Stop the transfer of `url` keeping what was written so far.
    ///
    /// Returns once the transfer loop has stopped and the resume state is
    /// persisted.
    #[instrument(skip(self), fields(url = %url), level = "debug")]
    pub async fn pause(&self, url: &Url) -> Result<()> {
        let task = self
            .task(url)
            .ok_or_else(|| CacheError::NotFound(url.to_string()))?;

        let handle = {
            let mut inner = task.lock();
            if inner.state != DownloadState::Downloading {
                return Ok(());
            }
            inner.stop = Some(StopReason::Pause);
            if let Some(cancel) = &inner.cancel {
                cancel.cancel();
            }
            inner.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(url = %url, error = %e, "Transfer task panicked while pausing");
            }
        }
        Ok(())
    }

    /// Continue a paused transfer, from its resume token when there is one.
    ///
    /// A paused transfer from an earlier process is rebuilt from its
    /// persisted record.
    #[instrument(skip(self), fields(url = %url), level = "debug")]
    pub async fn resume(&self, url: &Url) -> Result<()> {
        let task = match self.task(url) {
            Some(task) => task,
            None => {
                let record = self
                    .inner
                    .load_record(url)
                    .await
                    .ok_or_else(|| CacheError::NotFound(url.to_string()))?;
                let request = DownloadRequest::new(url.clone(), record.kind, record.tier);
                match self.inner.get_or_insert(request, false) {
                    Slot::Existing(task) => task,
                    Slot::Created(task, _) => {
                        restore_record(&task, record);
                        task
                    }
                }
            }
        };

        self.inner.spawn(&task);
        Ok(())
    }

    /// Terminate the transfer of `url` and drop everything it wrote.
    ///
    /// Subscribers are released without a completion event. Returns whether
    /// there was anything to cancel.
    #[instrument(skip(self), fields(url = %url), level = "debug")]
    pub async fn cancel(&self, url: &Url) -> bool {
        let task = self.inner.tasks.lock().remove(url.as_str());
        let record = self.inner.load_record(url).await;
        if record.is_some() {
            self.inner.remove_record(url).await;
        }

        let mut kind = record.as_ref().map(|r| r.kind);
        if let Some(task) = &task {
            kind = Some(task.request().kind);
            let handle = {
                let mut inner = task.lock();
                inner.stop = Some(StopReason::Cancel);
                inner.state = DownloadState::Cancelled;
                inner.drop_subscribers();
                if let Some(cancel) = inner.cancel.take() {
                    cancel.cancel();
                }
                inner.handle.take()
            };
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!(url = %url, error = %e, "Transfer task panicked while cancelling");
                }
            }
            task.stream().fail(CacheError::Cancelled);
        }

        match kind {
            Some(kind) => self.inner.files.delete_temp(url, kind).await,
            None => {
                remove_quietly(&self.inner.files.part_path(url)).await;
            }
        }

        let cancelled = task.is_some() || record.is_some();
        if cancelled {
            info!(url = %url, "Download cancelled");
        }
        cancelled
    }
}

impl CoordinatorInner {
    fn get_or_insert(&self, request: DownloadRequest, subscribe: bool) -> Slot {
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(request.url.as_str()) {
            return Slot::Existing(existing.clone());
        }
        let key = request.url.to_string();
        let task = Arc::new(DownloadTask::new(request));
        let subscription = subscribe.then(|| task.subscribe());
        tasks.insert(key, task.clone());
        Slot::Created(task, subscription)
    }

    fn remove_task(&self, task: &Arc<DownloadTask>) {
        let mut tasks = self.tasks.lock();
        let same = tasks
            .get(task.url().as_str())
            .is_some_and(|current| Arc::ptr_eq(current, task));
        if same {
            tasks.remove(task.url().as_str());
        }
    }

    /// Launch the transfer loop unless one is already running
    fn spawn(self: &Arc<Self>, task: &Arc<DownloadTask>) {
        let mut inner = task.lock();
        if matches!(
            inner.state,
            DownloadState::Downloading | DownloadState::Finished | DownloadState::Cancelled
        ) {
            return;
        }

        let cancel = CancellationToken::new();
        inner.state = DownloadState::Downloading;
        inner.stop = None;
        inner.cancel = Some(cancel.clone());

        let this = self.clone();
        let task_ref = task.clone();
        inner.handle = Some(tokio::spawn(async move {
            this.run(task_ref, cancel).await;
        }));
    }

    async fn run(self: Arc<Self>, task: Arc<DownloadTask>, cancel: CancellationToken) {
        match self.drive(&task, &cancel).await {
            Ok(Outcome::Completed { path, size }) => self.complete(&task, path, size).await,
            Ok(Outcome::Stopped) => self.stopped(&task).await,
            Err(e) => self.fail(&task, e).await,
        }
    }

    async fn drive(&self, task: &Arc<DownloadTask>, cancel: &CancellationToken) -> Result<Outcome> {
        let request = task.request().clone();
        let url = &request.url;

        if self.files.has_staged(url, request.kind).await {
            info!(url = %url, "Found a staged body, finishing without network");
            return self.finalize(task, false).await;
        }

        let mut written = self.verify_part(task).await;
        let token = task.lock().resume_token.clone();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Outcome::Stopped),
            response = self.transport.open(url, token.as_ref()) => response?,
        };

        if response.start_offset != written {
            if response.start_offset != 0 {
                return Err(CacheError::InvalidRange {
                    offset: response.start_offset,
                    length: written,
                });
            }
            let unchanged = {
                let mut inner = task.lock();
                inner.written = 0;
                let unchanged = inner.validator.is_some() && inner.validator == response.validator;
                inner.validator = response.validator.clone();
                unchanged
            };
            info!(url = %url, discarded = written, unchanged, "Transfer restarted from the beginning");
            written = 0;
            // Streamed bytes of a different entity must not be mixed with the new body
            if !unchanged {
                task.stream().restart();
            }
            task.emit(DownloadEvent::Reset);
        }

        let expected = response.total_length;
        {
            let mut inner = task.lock();
            inner.written = written;
            inner.expected = expected;
            inner.accepts_ranges = response.accepts_ranges;
            inner.resume_token = None;
            if response.validator.is_some() {
                inner.validator = response.validator.clone();
            }
        }

        let part = self.files.part_path(url);
        let mut file = open_part(&part, written).await?;
        if written > 0 {
            self.backfill_stream(task, &part, written).await?;
        }

        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| guess_content_type(url, request.kind));
        task.stream()
            .on_response(ContentInfo::new(Some(content_type), expected));
        debug!(url = %url, offset = written, expected = ?expected, "Transfer opened");
        task.emit(DownloadEvent::Started { expected });

        let mut body = response.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Ok(Outcome::Stopped);
                }
                next = body.next() => next,
            };

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            task.stream().append_at(written, &chunk);
            written += chunk.len() as u64;
            task.lock().written = written;
            task.emit(DownloadEvent::Progress {
                written,
                expected,
                fraction: progress_fraction(written, expected),
            });
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = expected {
            if written < expected {
                return Err(CacheError::IncompleteBody { written, expected });
            }
        }

        self.finalize(task, true).await
    }

    /// Written count to continue from; drops the token if the part file is short
    async fn verify_part(&self, task: &Arc<DownloadTask>) -> u64 {
        let written = task.lock().written;
        if written == 0 {
            return 0;
        }

        let on_disk = fs::metadata(self.files.part_path(task.url()))
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if on_disk < written {
            warn!(
                url = %task.url(),
                written,
                on_disk,
                "Part file is shorter than recorded, restarting"
            );
            task.lock().resume_token = None;
        }
        written
    }

    /// Load bytes written by an earlier attempt into the stream buffer
    async fn backfill_stream(&self, task: &Arc<DownloadTask>, part: &Path, written: u64) -> Result<()> {
        let buffered = task.stream().buffered_len();
        if buffered >= written {
            return Ok(());
        }
        let mut file = fs::File::open(part).await?;
        file.seek(SeekFrom::Start(buffered)).await?;
        let mut buf = Vec::with_capacity((written - buffered) as usize);
        file.take(written - buffered).read_to_end(&mut buf).await?;
        task.stream().append_at(buffered, &buf);
        Ok(())
    }

    /// Stage, transform and move the finished body, then record it
    async fn finalize(&self, task: &Arc<DownloadTask>, streamed: bool) -> Result<Outcome> {
        let request = task.request();
        let (url, kind) = (&request.url, request.kind);

        let staged = if self.files.has_staged(url, kind).await {
            self.files.staged_path(url, kind)
        } else {
            self.files.stage(url, kind).await?
        };

        let artifact = self.transform.transform(&staged, kind).await?;
        if task.lock().stop == Some(StopReason::Cancel) {
            return Ok(Outcome::Stopped);
        }

        let path = self.files.move_into_place(&artifact, url, kind).await?;
        if artifact != staged {
            remove_quietly(&staged).await;
        }

        let (path, size, bytes) = match request.tier {
            CacheTier::Memory => {
                let bytes = Bytes::from(fs::read(&path).await?);
                self.memory.put(url.as_str(), bytes.clone());
                self.files.delete(url, kind).await;
                self.index
                    .upsert(ResourceIdentity::new(url.as_str(), kind, CacheTier::Memory))
                    .await;
                (None, bytes.len() as u64, Some(bytes))
            }
            CacheTier::Disk | CacheTier::None => {
                let size = fs::metadata(&path).await?.len();
                self.index
                    .upsert(ResourceIdentity::new(url.as_str(), kind, CacheTier::Disk))
                    .await;
                (Some(path), size, None)
            }
        };

        if !streamed {
            let bytes = match (bytes, &path) {
                (Some(bytes), _) => bytes,
                (None, Some(path)) => Bytes::from(fs::read(path).await?),
                (None, None) => Bytes::new(),
            };
            task.stream().on_response(ContentInfo::new(
                Some(guess_content_type(url, kind)),
                Some(bytes.len() as u64),
            ));
            task.stream().append_at(0, &bytes);
        }

        Ok(Outcome::Completed { path, size })
    }

    async fn complete(&self, task: &Arc<DownloadTask>, path: Option<PathBuf>, size: u64) {
        self.remove_task(task);
        self.remove_record(task.url()).await;
        {
            let mut inner = task.lock();
            inner.state = DownloadState::Finished;
            inner.cancel = None;
            inner.handle = None;
        }
        task.stream().finish();
        info!(url = %task.url(), size, "Download finished");
        task.emit(DownloadEvent::Finished { path, size });
    }

    async fn stopped(&self, task: &Arc<DownloadTask>) {
        let (reason, checkpoint) = {
            let inner = task.lock();
            (inner.stop, inner.checkpoint())
        };

        if reason != Some(StopReason::Pause) {
            debug!(url = %task.url(), "Transfer stopped");
            return;
        }

        let token = self.transport.resume_token(task.url(), &checkpoint);
        let resumable = token.is_some();
        self.save_record(task.request(), &checkpoint, token.as_ref()).await;
        {
            let mut inner = task.lock();
            inner.resume_token = token;
            inner.state = DownloadState::Paused;
            inner.cancel = None;
        }
        info!(url = %task.url(), written = checkpoint.written, resumable, "Download paused");
        task.emit(DownloadEvent::Paused { resumable });
    }

    async fn fail(&self, task: &Arc<DownloadTask>, error: CacheError) {
        if error.is_transport() {
            warn!(url = %task.url(), error = %error, "Download failed");
        } else {
            error!(url = %task.url(), error = %error, "Download failed");
        }
        self.remove_task(task);
        self.remove_record(task.url()).await;
        self.files.delete_temp(task.url(), task.request().kind).await;
        {
            let mut inner = task.lock();
            inner.state = DownloadState::None;
            inner.cancel = None;
            inner.handle = None;
        }
        task.stream().fail(error.clone());
        task.emit(DownloadEvent::Failed(error));
    }

    /// Completion event for a resource that is already cached
    async fn cached_completion(&self, request: &DownloadRequest) -> Option<DownloadEvent> {
        let identity = self.index.lookup(&request.url)?;
        match identity.tier {
            CacheTier::Disk => {
                if !self.index.exists_and_valid(&request.url).await {
                    return None;
                }
                let info = self.files.info(&request.url, identity.kind).await?;
                Some(DownloadEvent::Finished {
                    path: Some(info.path),
                    size: info.size_bytes,
                })
            }
            CacheTier::Memory => self
                .memory
                .get(request.url.as_str())
                .map(|bytes| DownloadEvent::Finished {
                    path: None,
                    size: bytes.len() as u64,
                }),
            CacheTier::None => None,
        }
    }

    async fn load_record(&self, url: &Url) -> Option<ResumeRecord> {
        // Records are keyed by path; another host may own this one.
        self.load_record_by_key(&resume_key(url))
            .await
            .filter(|record| record.url == url.as_str())
    }

    async fn load_record_by_key(&self, key: &str) -> Option<ResumeRecord> {
        let bytes = match self.kv.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read resume record");
                return None;
            }
        };
        match serde_json::from_slice::<ResumeRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "Resume record is corrupt");
                None
            }
        }
    }

    async fn save_record(
        &self,
        request: &DownloadRequest,
        checkpoint: &TransferCheckpoint,
        token: Option<&ResumeToken>,
    ) {
        let record = ResumeRecord {
            url: request.url.to_string(),
            kind: request.kind,
            tier: request.tier,
            written: checkpoint.written,
            expected: checkpoint.expected,
            token: token.map(|t| hex::encode(t.as_bytes())),
            validator: checkpoint.validator.clone(),
        };
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Failed to serialize resume record");
                return;
            }
        };
        if let Err(e) = self.kv.set(&resume_key(&request.url), &bytes).await {
            warn!(url = %request.url, error = %e, "Failed to persist resume record");
        }
    }

    async fn remove_record(&self, url: &Url) {
        let key = resume_key(url);
        if self
            .load_record_by_key(&key)
            .await
            .is_some_and(|record| record.url != url.as_str())
        {
            return;
        }
        if let Err(e) = self.kv.remove(&key).await {
            warn!(url = %url, error = %e, "Failed to remove resume record");
        }
    }
}

/// Seed a fresh task with the progress of an earlier, paused transfer
fn restore_record(task: &DownloadTask, record: ResumeRecord) {
    let token = record.token();
    let mut inner = task.lock();
    inner.written = record.written;
    inner.expected = record.expected;
    inner.validator = record.validator;
    inner.resume_token = token;
    debug!(url = %task.url(), written = record.written, "Restored resume record");
}

/// Open the part file positioned at `written`, dropping anything after it
async fn open_part(path: &Path, written: u64) -> Result<fs::File> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.set_len(written).await?;
    file.seek(SeekFrom::Start(written)).await?;
    Ok(file)
}
