//! # Media Cache
//!
//! Consumer facade tying the index, file store, memory cache, download
//! coordinator and stream engine together.
//!
//! A consumer asks [`MediaCache::request_resource`] what exists, then either
//! reads from the cache or attaches to a download. Range reads are served
//! from whichever source currently holds the bytes: an active transfer, the
//! memory tier or the disk tier.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs;
use tracing::{debug, info};
use url::Url;

use crate::config::CacheConfig;
use crate::download::{
    DownloadCoordinator, DownloadRequest, DownloadState, DownloadSubscription, HttpTransport,
    PassThrough, ResourceTransform, Transport,
};
use crate::error::{CacheError, Result};
use crate::index::ResourceIndex;
use crate::memory::{CacheStats, DeflateCodec, TieredMemoryCache};
use crate::resource::{
    CacheTier, ResourceIdentity, ResourceKind, ResourceState, guess_content_type, normalize_url,
};
use crate::storage::{FileKvStore, FileStore, KeyValueStore, StoredFile};
use crate::stream::{ContentInfo, ReadHandle, ReadId, ReadRequest};

/// Where the bytes passed to [`MediaCache::store`] come from
#[derive(Debug, Clone)]
pub enum StoreSource {
    Bytes(Bytes),
    File(PathBuf),
}

impl From<Bytes> for StoreSource {
    fn from(bytes: Bytes) -> Self {
        StoreSource::Bytes(bytes)
    }
}

impl From<PathBuf> for StoreSource {
    fn from(path: PathBuf) -> Self {
        StoreSource::File(path)
    }
}

/// Result of a range read: what was available immediately, plus a handle
/// for the rest when the bytes are still arriving
#[derive(Debug)]
pub struct RangeRead {
    pub info: Option<ContentInfo>,
    pub initial: Bytes,
    pub remainder: Option<ReadHandle>,
}

impl RangeRead {
    fn from_handle(mut handle: ReadHandle) -> Result<Self> {
        let ready = handle.take_ready()?;
        Ok(Self {
            info: ready.info,
            initial: ready.data,
            remainder: (!ready.complete).then_some(handle),
        })
    }

    /// Whether the whole range (or everything up to the end) was delivered
    pub fn is_complete(&self) -> bool {
        self.remainder.is_none()
    }

    /// Id of the pending remainder, for [`MediaCache::cancel_read`]
    pub fn pending_id(&self) -> Option<ReadId> {
        self.remainder.as_ref().map(|handle| handle.id())
    }

    /// Wait for the remainder and return the whole range
    pub async fn read_to_end(self) -> Result<Bytes> {
        let Some(remainder) = self.remainder else {
            return Ok(self.initial);
        };
        let rest = remainder.read_to_end().await?;
        let mut all = BytesMut::with_capacity(self.initial.len() + rest.len());
        all.extend_from_slice(&self.initial);
        all.extend_from_slice(&rest);
        Ok(all.freeze())
    }
}

struct MediaCacheInner {
    config: CacheConfig,
    files: Arc<FileStore>,
    index: Arc<ResourceIndex>,
    memory: Arc<TieredMemoryCache<Bytes>>,
    coordinator: DownloadCoordinator,
}

/// Progressive media cache.
///
/// Cheap to clone; clones share all state. Several independent instances
/// may exist side by side as long as they use different root directories.
#[derive(Clone)]
pub struct MediaCache {
    inner: Arc<MediaCacheInner>,
}

impl MediaCache {
    /// Create a cache with the HTTP transport and a file-backed substrate
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.transport)?);
        let kv = Arc::new(FileKvStore::open(config.state_dir()).await?);
        Self::with_parts(config, transport, kv, Arc::new(PassThrough)).await
    }

    /// Create a cache from explicit collaborators
    pub async fn with_parts(
        config: CacheConfig,
        transport: Arc<dyn Transport>,
        kv: Arc<dyn KeyValueStore>,
        transform: Arc<dyn ResourceTransform>,
    ) -> Result<Self> {
        let files = Arc::new(FileStore::open(&config.root_dir).await?);
        let index = Arc::new(ResourceIndex::load(kv.clone(), files.clone()).await);

        let memory = TieredMemoryCache::new(
            Arc::new(DeflateCodec::default()),
            config.memory_count_limit,
            config.memory_cost_limit,
        );
        let memory = Arc::new(if config.compress_memory {
            memory
        } else {
            memory.without_compression()
        });

        let coordinator = DownloadCoordinator::new(
            transport,
            transform,
            files.clone(),
            index.clone(),
            memory.clone(),
            kv,
        );

        info!(root = ?config.root_dir, indexed = index.len(), "Media cache ready");
        Ok(Self {
            inner: Arc::new(MediaCacheInner {
                config,
                files,
                index,
                memory,
                coordinator,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.inner.coordinator
    }

    pub fn files(&self) -> &FileStore {
        &self.inner.files
    }

    /// What exists for `url`, driving the consumer's next step
    pub async fn request_resource(
        &self,
        url: &str,
        kind: ResourceKind,
        tier: CacheTier,
    ) -> Result<ResourceState> {
        let url = normalize_url(url)?;

        let state = if let Some(state) = self.active_state(&url) {
            state
        } else if self.is_cached(&url).await {
            ResourceState::Cached
        } else if self.inner.coordinator.resume_record(&url).await.is_some() {
            ResourceState::Paused
        } else if self.inner.files.has_staged(&url, kind).await {
            ResourceState::Uncached
        } else {
            ResourceState::None
        };

        debug!(url = %url, kind = ?kind, tier = ?tier, state = ?state, "Resource requested");
        Ok(state)
    }

    fn active_state(&self, url: &Url) -> Option<ResourceState> {
        match self.inner.coordinator.state(url)? {
            DownloadState::None | DownloadState::Downloading => Some(ResourceState::Downloading),
            DownloadState::Paused => Some(ResourceState::Paused),
            DownloadState::Finished | DownloadState::Cancelled => None,
        }
    }

    async fn is_cached(&self, url: &Url) -> bool {
        let Some(identity) = self.inner.index.lookup(url) else {
            return false;
        };
        match identity.tier {
            CacheTier::Disk => self.inner.index.exists_and_valid(url).await,
            CacheTier::Memory => {
                if self.inner.memory.contains(url.as_str()) {
                    true
                } else {
                    debug!(url = %url, "Memory entry was evicted, dropping index entry");
                    self.inner.index.remove(url).await;
                    false
                }
            }
            CacheTier::None => false,
        }
    }

    /// Start or join the download of `url`
    pub async fn download(
        &self,
        url: &str,
        kind: ResourceKind,
        tier: CacheTier,
    ) -> Result<DownloadSubscription> {
        let url = normalize_url(url)?;
        self.inner
            .coordinator
            .start(DownloadRequest::new(url, kind, tier))
            .await
    }

    pub async fn pause(&self, url: &str) -> Result<()> {
        self.inner.coordinator.pause(&normalize_url(url)?).await
    }

    pub async fn resume(&self, url: &str) -> Result<()> {
        self.inner.coordinator.resume(&normalize_url(url)?).await
    }

    pub async fn cancel(&self, url: &str) -> Result<bool> {
        Ok(self.inner.coordinator.cancel(&normalize_url(url)?).await)
    }

    /// Progress of the active transfer of `url`
    pub fn progress(&self, url: &str) -> Option<f64> {
        let url = normalize_url(url).ok()?;
        self.inner.coordinator.progress(&url)
    }

    /// Read `length` bytes at `offset`.
    ///
    /// Bytes available now are returned in [`RangeRead::initial`]; if the
    /// resource is still downloading, the rest arrives through
    /// [`RangeRead::remainder`].
    pub async fn read_range(&self, url: &str, offset: u64, length: u64) -> Result<RangeRead> {
        let url = normalize_url(url)?;
        if offset.checked_add(length).is_none() {
            return Err(CacheError::InvalidRange { offset, length });
        }
        let request = ReadRequest::new(offset, length);

        if let Some(task) = self.inner.coordinator.task(&url) {
            return RangeRead::from_handle(task.stream().submit_read(request));
        }

        let Some(identity) = self.inner.index.lookup(&url) else {
            return Err(CacheError::NotFound(url.to_string()));
        };

        match identity.tier {
            CacheTier::Memory => {
                let Some(bytes) = self.inner.memory.get(url.as_str()) else {
                    self.inner.index.remove(&url).await;
                    return Err(CacheError::NotFound(url.to_string()));
                };
                let total = bytes.len() as u64;
                if length > 0 && offset >= total {
                    return Err(CacheError::OffsetBeyondEnd { offset, total });
                }
                let start = offset.min(total) as usize;
                let end = offset.saturating_add(length).min(total) as usize;
                Ok(RangeRead {
                    info: Some(ContentInfo::new(
                        Some(guess_content_type(&url, identity.kind)),
                        Some(total),
                    )),
                    initial: bytes.slice(start..end),
                    remainder: None,
                })
            }
            CacheTier::Disk => {
                let stored = match self.inner.files.info(&url, identity.kind).await {
                    Some(stored) => stored,
                    None => {
                        // Missing or zero-byte file; drop the entry.
                        self.inner.index.exists_and_valid(&url).await;
                        return Err(CacheError::NotFound(url.to_string()));
                    }
                };
                if length > 0 && offset >= stored.size_bytes {
                    return Err(CacheError::OffsetBeyondEnd {
                        offset,
                        total: stored.size_bytes,
                    });
                }
                let initial = self
                    .inner
                    .files
                    .read_range(&url, identity.kind, offset, length)
                    .await?;
                Ok(RangeRead {
                    info: Some(ContentInfo::new(
                        Some(guess_content_type(&url, identity.kind)),
                        Some(stored.size_bytes),
                    )),
                    initial,
                    remainder: None,
                })
            }
            CacheTier::None => Err(CacheError::NotFound(url.to_string())),
        }
    }

    /// Withdraw a pending read on an active transfer
    pub fn cancel_read(&self, url: &str, id: ReadId) -> bool {
        let Ok(url) = normalize_url(url) else {
            return false;
        };
        self.inner
            .coordinator
            .task(&url)
            .is_some_and(|task| task.stream().cancel_read(id))
    }

    /// Cache bytes or a file obtained elsewhere
    pub async fn store(
        &self,
        kind: ResourceKind,
        url: &str,
        source: impl Into<StoreSource>,
        tier: CacheTier,
    ) -> Result<()> {
        let url = normalize_url(url)?;
        let source = source.into();
        if let StoreSource::Bytes(bytes) = &source {
            if bytes.is_empty() {
                return Err(CacheError::EmptyResource(url.to_string()));
            }
        }

        match tier {
            CacheTier::Memory => {
                let bytes = match source {
                    StoreSource::Bytes(bytes) => bytes,
                    StoreSource::File(path) => Bytes::from(fs::read(&path).await?),
                };
                if bytes.is_empty() {
                    return Err(CacheError::EmptyResource(url.to_string()));
                }
                self.inner.memory.put(url.as_str(), bytes);
                self.inner.files.delete(&url, kind).await;
                self.inner
                    .index
                    .upsert(ResourceIdentity::new(url.as_str(), kind, CacheTier::Memory))
                    .await;
            }
            CacheTier::Disk | CacheTier::None => {
                match source {
                    StoreSource::Bytes(bytes) => {
                        self.inner.files.write_bytes(&url, kind, &bytes).await?;
                    }
                    StoreSource::File(path) => {
                        self.inner.files.import_file(&path, &url, kind).await?;
                    }
                }
                if !self.inner.files.exists(&url, kind).await {
                    return Err(CacheError::EmptyResource(url.to_string()));
                }
                self.inner.memory.remove(url.as_str());
                self.inner
                    .index
                    .upsert(ResourceIdentity::new(url.as_str(), kind, CacheTier::Disk))
                    .await;
            }
        }

        debug!(url = %url, kind = ?kind, tier = ?tier, "Stored resource");
        Ok(())
    }

    /// The whole cached resource, from memory or disk
    pub async fn load(&self, url: &str) -> Result<Option<Bytes>> {
        let url = normalize_url(url)?;
        let Some(identity) = self.inner.index.lookup(&url) else {
            return Ok(None);
        };
        match identity.tier {
            CacheTier::Memory => Ok(self.inner.memory.get(url.as_str())),
            CacheTier::Disk => self.inner.files.read(&url, identity.kind).await,
            CacheTier::None => Ok(None),
        }
    }

    /// Drop `url` from every tier. Returns whether anything was removed.
    pub async fn evict(&self, url: &str) -> Result<bool> {
        let url = normalize_url(url)?;
        let identity = self.inner.index.lookup(&url);
        let mut removed = self.inner.index.remove(&url).await;
        removed |= self.inner.memory.remove(url.as_str());

        let kinds = match &identity {
            Some(identity) => vec![identity.kind],
            None => ResourceKind::ALL.to_vec(),
        };
        for kind in kinds {
            removed |= self.inner.files.delete(&url, kind).await;
        }

        if removed {
            info!(url = %url, "Evicted resource");
        }
        Ok(removed)
    }

    /// Remove every cached resource, or only those of `kind`.
    ///
    /// Active and paused transfers of the cleared kinds are cancelled first.
    pub async fn clear_all(&self, kind: Option<ResourceKind>) -> Result<()> {
        let cancelled = self.inner.coordinator.cancel_all(kind).await;

        let removed = self.inner.index.remove_all(kind).await;
        match kind {
            None => self.inner.memory.clear(),
            Some(_) => {
                for identity in removed.iter().filter(|i| i.tier == CacheTier::Memory) {
                    self.inner.memory.remove(&identity.source_url);
                }
            }
        }
        self.inner.files.clear(kind).await?;

        info!(kind = ?kind, removed = removed.len(), cancelled, "Cleared cache");
        Ok(())
    }

    /// Every file currently persisted on disk
    pub async fn cache_info(&self) -> Result<Vec<StoredFile>> {
        self.inner.files.list(None).await
    }

    pub fn memory_stats(&self) -> CacheStats {
        self.inner.memory.stats()
    }

    pub fn set_memory_count_limit(&self, limit: usize) {
        self.inner.memory.set_count_limit(limit);
    }

    pub fn set_memory_cost_limit(&self, limit: usize) {
        self.inner.memory.set_cost_limit(limit);
    }

    /// Every indexed resource
    pub fn entries(&self) -> Vec<ResourceIdentity> {
        self.inner.index.entries()
    }
}
