//! # Resource Index
//!
//! Persisted mapping of resource identity to kind and cache tier.
//!
//! The set lives behind a reader/writer lock. Every write re-serializes the
//! whole set to the key-value substrate; writes are rare next to lookups.
//! Substrate failures are logged and never propagate: losing the index only
//! costs a re-download.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::resource::{CacheTier, ResourceIdentity, ResourceKind};
use crate::storage::{FileStore, KeyValueStore};

/// Namespace key of the serialized identity set
pub const INDEX_KEY: &str = "mediacache.resources";

pub struct ResourceIndex {
    entries: RwLock<HashSet<ResourceIdentity>>,
    // Held across the substrate write so snapshots land in mutation order.
    persist_lock: tokio::sync::Mutex<()>,
    kv: Arc<dyn KeyValueStore>,
    files: Arc<FileStore>,
}

impl ResourceIndex {
    /// Load the index from `kv`, starting empty if it is missing or unreadable.
    ///
    /// Memory-tier entries cannot outlive the process that created them and
    /// are dropped here.
    pub async fn load(kv: Arc<dyn KeyValueStore>, files: Arc<FileStore>) -> Self {
        let entries = match kv.get(INDEX_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<ResourceIdentity>>(&bytes) {
                Ok(list) => list
                    .into_iter()
                    .filter(|identity| identity.tier == CacheTier::Disk)
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "Resource index is corrupt, starting empty");
                    HashSet::new()
                }
            },
            Ok(None) => HashSet::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load resource index, starting empty");
                HashSet::new()
            }
        };

        debug!(count = entries.len(), "Loaded resource index");
        Self {
            entries: RwLock::new(entries),
            persist_lock: tokio::sync::Mutex::new(()),
            kv,
            files,
        }
    }

    async fn persist(&self, snapshot: Vec<ResourceIdentity>) {
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize resource index");
                return;
            }
        };
        if let Err(e) = self.kv.set(INDEX_KEY, &bytes).await {
            warn!(error = %e, "Failed to persist resource index");
        }
    }

    pub fn lookup(&self, url: &Url) -> Option<ResourceIdentity> {
        self.entries.read().get(url.as_str()).cloned()
    }

    /// Insert or replace the entry for the identity's URL
    pub async fn upsert(&self, identity: ResourceIdentity) {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let mut entries = self.entries.write();
            debug!(identity = %identity, "Recording resource");
            entries.replace(identity);
            entries.iter().cloned().collect()
        };
        self.persist(snapshot).await;
    }

    /// Remove the entry for `url`. Returns whether one existed.
    pub async fn remove(&self, url: &Url) -> bool {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let mut entries = self.entries.write();
            if !entries.remove(url.as_str()) {
                return false;
            }
            entries.iter().cloned().collect()
        };
        self.persist(snapshot).await;
        true
    }

    /// Remove every entry, or only those of `kind`. Returns the removed identities.
    pub async fn remove_all(&self, kind: Option<ResourceKind>) -> Vec<ResourceIdentity> {
        let _persist = self.persist_lock.lock().await;
        let (removed, snapshot) = {
            let mut entries = self.entries.write();
            let (removed, kept): (Vec<_>, Vec<_>) = entries
                .drain()
                .partition(|identity| kind.is_none_or(|k| identity.kind == k));
            entries.extend(kept);
            let snapshot: Vec<ResourceIdentity> = entries.iter().cloned().collect();
            (removed, snapshot)
        };
        if !removed.is_empty() {
            self.persist(snapshot).await;
        }
        removed
    }

    pub fn entries(&self) -> Vec<ResourceIdentity> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether `url` is indexed and its bytes are actually present.
    ///
    /// Disk entries are checked against the file store; a missing or
    /// zero-byte file removes both the file and the entry.
    pub async fn exists_and_valid(&self, url: &Url) -> bool {
        let Some(identity) = self.lookup(url) else {
            return false;
        };

        match identity.tier {
            CacheTier::Disk => {
                if self.files.info(url, identity.kind).await.is_some() {
                    true
                } else {
                    warn!(url = %url, "Indexed file is missing or empty, dropping entry");
                    self.files.delete(url, identity.kind).await;
                    self.remove(url).await;
                    false
                }
            }
            // The memory cache owner revalidates these.
            CacheTier::Memory => true,
            CacheTier::None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, Result};
    use crate::storage::MemoryKvStore;
    use tempfile::TempDir;

    struct FailingKv;

    #[async_trait::async_trait]
    impl KeyValueStore for FailingKv {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(CacheError::Persistence("substrate offline".into()))
        }
        async fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(CacheError::Persistence("substrate offline".into()))
        }
        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn keys(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn files() -> (TempDir, Arc<FileStore>) {
        let dir = TempDir::new().unwrap();
        let files = FileStore::open(dir.path()).await.unwrap();
        (dir, Arc::new(files))
    }

    #[tokio::test]
    async fn test_upsert_updates_tier_in_place_and_persists() {
        let (_dir, files) = files().await;
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let index = ResourceIndex::load(kv.clone(), files.clone()).await;
        let u = url("https://x/a.mp4");

        index.upsert(ResourceIdentity::new(u.as_str(), ResourceKind::Video, CacheTier::Memory)).await;
        index.upsert(ResourceIdentity::new(u.as_str(), ResourceKind::Video, CacheTier::Disk)).await;
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&u).unwrap().tier, CacheTier::Disk);

        let reloaded = ResourceIndex::load(kv, files).await;
        assert_eq!(reloaded.lookup(&u).unwrap().tier, CacheTier::Disk);
    }

    #[tokio::test]
    async fn test_memory_entries_do_not_survive_reload() {
        let (_dir, files) = files().await;
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let index = ResourceIndex::load(kv.clone(), files.clone()).await;
        index.upsert(ResourceIdentity::new("https://x/m.jpg", ResourceKind::Image, CacheTier::Memory)).await;
        index.upsert(ResourceIdentity::new("https://x/d.jpg", ResourceKind::Image, CacheTier::Disk)).await;

        let reloaded = ResourceIndex::load(kv, files).await;
        assert!(reloaded.lookup(&url("https://x/m.jpg")).is_none());
        assert!(reloaded.lookup(&url("https://x/d.jpg")).is_some());
    }

    #[tokio::test]
    async fn test_remove_all_by_kind() {
        let (_dir, files) = files().await;
        let index = ResourceIndex::load(Arc::new(MemoryKvStore::new()), files).await;
        index.upsert(ResourceIdentity::new("https://x/a.mp4", ResourceKind::Video, CacheTier::Disk)).await;
        index.upsert(ResourceIdentity::new("https://x/b.jpg", ResourceKind::Image, CacheTier::Disk)).await;

        let removed = index.remove_all(Some(ResourceKind::Image)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].source_url, "https://x/b.jpg");
        assert_eq!(index.len(), 1);

        index.remove_all(None).await;
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_exists_and_valid_self_heals_zero_byte_file() {
        let (_dir, files) = files().await;
        let index = ResourceIndex::load(Arc::new(MemoryKvStore::new()), files.clone()).await;
        let u = url("https://x/a.mp4");
        let path = files.path_for(&u, ResourceKind::Video, None);
        std::fs::write(&path, b"").unwrap();
        index.upsert(ResourceIdentity::new(u.as_str(), ResourceKind::Video, CacheTier::Disk)).await;

        assert!(!index.exists_and_valid(&u).await);
        assert!(!path.exists());
        assert!(index.lookup(&u).is_none());
    }

    #[tokio::test]
    async fn test_exists_and_valid_with_real_file() {
        let (_dir, files) = files().await;
        let index = ResourceIndex::load(Arc::new(MemoryKvStore::new()), files.clone()).await;
        let u = url("https://x/a.mp4");
        files.write_bytes(&u, ResourceKind::Video, b"data").await.unwrap();
        index.upsert(ResourceIdentity::new(u.as_str(), ResourceKind::Video, CacheTier::Disk)).await;

        assert!(index.exists_and_valid(&u).await);
        assert!(!index.exists_and_valid(&url("https://x/other.mp4")).await);
    }

    #[tokio::test]
    async fn test_substrate_failures_degrade_to_empty_index() {
        let (_dir, files) = files().await;
        let index = ResourceIndex::load(Arc::new(FailingKv), files).await;
        assert!(index.is_empty());

        // Writes still update the in-memory set
        index.upsert(ResourceIdentity::new("https://x/a.mp4", ResourceKind::Video, CacheTier::Disk)).await;
        assert_eq!(index.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_all_persisted() {
        let (_dir, files) = files().await;
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
        let index = Arc::new(ResourceIndex::load(kv.clone(), files.clone()).await);

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let index = index.clone();
                tokio::spawn(async move {
                    let url = format!("https://x/{i}.jpg");
                    index
                        .upsert(ResourceIdentity::new(&url, ResourceKind::Image, CacheTier::Disk))
                        .await;
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let reloaded = ResourceIndex::load(kv, files).await;
        assert_eq!(reloaded.len(), 16);
    }
}
