//! # File Store
//!
//! Content-addressed on-disk layout for cached resources.
//!
//! ```text
//! <root>/video/<sha256(url)>[_<w>x<h>].<ext>
//! <root>/image/<sha256(url)>[_<w>x<h>].<ext>
//! <root>/tmp/<sha256(url)>.part        bytes still arriving
//! <root>/tmp/<sha256(url)>.<ext>       body complete, not yet moved into place
//! ```

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{self, AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, warn};
use url::Url;

use crate::error::{CacheError, Result};
use crate::resource::{ResourceKind, url_extension};

const TEMP_DIR: &str = "tmp";

/// A persisted artifact on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Optional size suffix for multi-resolution image variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeVariant {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileStore {
    /// Open a store rooted at `root`, creating every directory it uses
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            root: root.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        };
        store.ensure_initialized().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_initialized(&self) -> io::Result<()> {
        // Fast path - already initialized
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        // create_dir_all is idempotent, so racing initializers are harmless
        fs::create_dir_all(self.root.join(TEMP_DIR)).await?;
        for kind in ResourceKind::ALL {
            fs::create_dir_all(self.kind_dir(kind)).await?;
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn kind_dir(&self, kind: ResourceKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    fn url_hash(url: &Url) -> String {
        let hash = Sha256::digest(url.as_str().as_bytes());
        format!("{hash:x}")
    }

    fn extension(url: &Url, kind: ResourceKind) -> String {
        url_extension(url).unwrap_or_else(|| kind.default_extension().to_string())
    }

    /// Deterministic permanent path for a resource
    pub fn path_for(&self, url: &Url, kind: ResourceKind, variant: Option<SizeVariant>) -> PathBuf {
        let mut name = Self::url_hash(url);
        if let Some(v) = variant {
            name.push_str(&format!("_{}x{}", v.width, v.height));
        }
        name.push('.');
        name.push_str(&Self::extension(url, kind));
        self.kind_dir(kind).join(name)
    }

    /// Path bytes are written to while a transfer is in flight
    pub fn part_path(&self, url: &Url) -> PathBuf {
        self.temp_dir().join(format!("{}.part", Self::url_hash(url)))
    }

    /// Path of a completed body waiting for transform and move
    pub fn staged_path(&self, url: &Url, kind: ResourceKind) -> PathBuf {
        self.temp_dir()
            .join(format!("{}.{}", Self::url_hash(url), Self::extension(url, kind)))
    }

    /// Rename a finished `.part` file to its staged name
    pub async fn stage(&self, url: &Url, kind: ResourceKind) -> Result<PathBuf> {
        let part = self.part_path(url);
        let staged = self.staged_path(url, kind);
        if !fs::try_exists(&part).await? {
            error!(path = ?part, "Finished transfer has no part file");
            return Err(CacheError::MissingTempFile(part));
        }
        fs::rename(&part, &staged).await?;
        Ok(staged)
    }

    /// Whether a completed body is waiting to be moved into place
    pub async fn has_staged(&self, url: &Url, kind: ResourceKind) -> bool {
        Self::non_empty_len(&self.staged_path(url, kind)).await.is_some()
    }

    /// Atomically relocate a completed temp file to the permanent path of `url`.
    ///
    /// A missing temp file means the caller broke the completion contract;
    /// it is reported loudly and never retried.
    pub async fn move_into_place(&self, temp: &Path, url: &Url, kind: ResourceKind) -> Result<PathBuf> {
        self.move_variant_into_place(temp, url, kind, None).await
    }

    pub async fn move_variant_into_place(
        &self,
        temp: &Path,
        url: &Url,
        kind: ResourceKind,
        variant: Option<SizeVariant>,
    ) -> Result<PathBuf> {
        self.ensure_initialized().await?;

        if !fs::try_exists(temp).await? {
            error!(path = ?temp, url = %url, "Temporary file is unreachable at move time");
            return Err(CacheError::MissingTempFile(temp.to_path_buf()));
        }

        let dest = self.path_for(url, kind, variant);
        if let Err(e) = fs::rename(temp, &dest).await {
            // Rename fails across filesystems; fall back to copy + remove.
            warn!(from = ?temp, to = ?dest, error = %e, "Rename failed, copying instead");
            let staging = dest.with_extension("moving");
            fs::copy(temp, &staging).await?;
            fs::rename(&staging, &dest).await?;
            remove_quietly(temp).await;
        }

        debug!(url = %url, path = ?dest, "Moved resource into place");
        Ok(dest)
    }

    /// Write bytes straight to the permanent path via a temp file
    pub async fn write_bytes(&self, url: &Url, kind: ResourceKind, data: &[u8]) -> Result<PathBuf> {
        self.ensure_initialized().await?;
        let temp = self.temp_dir().join(format!("{}.write", Self::url_hash(url)));
        if let Err(e) = fs::write(&temp, data).await {
            warn!(path = ?temp, error = %e, "Failed to write cache file");
            remove_quietly(&temp).await;
            return Err(e.into());
        }
        self.move_into_place(&temp, url, kind).await
    }

    /// Copy an external file into the store
    pub async fn import_file(&self, source: &Path, url: &Url, kind: ResourceKind) -> Result<PathBuf> {
        self.ensure_initialized().await?;
        let temp = self.temp_dir().join(format!("{}.write", Self::url_hash(url)));
        fs::copy(source, &temp).await?;
        self.move_into_place(&temp, url, kind).await
    }

    /// Size of a file, treating zero-length files as absent and deleting them
    async fn non_empty_len(path: &Path) -> Option<u64> {
        match fs::metadata(path).await {
            Ok(meta) if meta.len() == 0 => {
                warn!(path = ?path, "Removing zero-byte cache file");
                remove_quietly(path).await;
                None
            }
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        }
    }

    async fn stored_file(path: PathBuf) -> Option<StoredFile> {
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => return None,
        };
        if meta.len() == 0 {
            warn!(path = ?path, "Removing zero-byte cache file");
            remove_quietly(&path).await;
            return None;
        }
        let created: SystemTime = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or_else(|_| SystemTime::now());
        Some(StoredFile {
            path,
            size_bytes: meta.len(),
            created_at: DateTime::<Utc>::from(created),
        })
    }

    /// Information about the permanent file for `url`.
    ///
    /// A zero-byte file is deleted as a side effect and reported as absent.
    pub async fn info(&self, url: &Url, kind: ResourceKind) -> Option<StoredFile> {
        Self::stored_file(self.path_for(url, kind, None)).await
    }

    pub async fn exists(&self, url: &Url, kind: ResourceKind) -> bool {
        self.info(url, kind).await.is_some()
    }

    /// Read the whole permanent file
    pub async fn read(&self, url: &Url, kind: ResourceKind) -> Result<Option<Bytes>> {
        if self.info(url, kind).await.is_none() {
            return Ok(None);
        }
        match fs::read(self.path_for(url, kind, None)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read at most `length` bytes starting at `offset` from the permanent file
    pub async fn read_range(
        &self,
        url: &Url,
        kind: ResourceKind,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let path = self.path_for(url, kind, None);
        let mut file = fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let to_read = length.min(size - offset);
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(to_read as usize);
        (&mut file).take(to_read).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Delete the permanent file for `url`. Returns whether a file was removed.
    pub async fn delete(&self, url: &Url, kind: ResourceKind) -> bool {
        remove_quietly(&self.path_for(url, kind, None)).await
    }

    /// Delete every temporary artifact belonging to `url`
    pub async fn delete_temp(&self, url: &Url, kind: ResourceKind) {
        remove_quietly(&self.part_path(url)).await;
        remove_quietly(&self.staged_path(url, kind)).await;
    }

    /// Remove all files of `kind`, or everything when `kind` is `None`
    pub async fn clear(&self, kind: Option<ResourceKind>) -> Result<()> {
        let dirs = match kind {
            Some(kind) => vec![self.kind_dir(kind)],
            None => {
                let mut dirs: Vec<PathBuf> = ResourceKind::ALL.iter().map(|k| self.kind_dir(*k)).collect();
                dirs.push(self.temp_dir());
                dirs
            }
        };

        for dir in dirs {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Failed to clear cache directory");
                    return Err(e.into());
                }
            }
        }

        // Recreate the layout
        self.initialized.store(false, Ordering::Release);
        self.ensure_initialized().await?;
        debug!(kind = ?kind, "Cleared file store");
        Ok(())
    }

    /// Every non-empty permanent file, optionally restricted to one kind
    pub async fn list(&self, kind: Option<ResourceKind>) -> Result<Vec<StoredFile>> {
        let kinds: Vec<ResourceKind> = match kind {
            Some(kind) => vec![kind],
            None => ResourceKind::ALL.to_vec(),
        };

        let mut files = Vec::new();
        for kind in kinds {
            let mut entries = match fs::read_dir(self.kind_dir(kind)).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if let Some(file) = Self::stored_file(entry.path()).await {
                    files.push(file);
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

/// Remove a file, treating "not found" as success. Returns whether a file was removed.
pub(crate) async fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to remove file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("cache")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_layout_is_created_and_paths_are_deterministic() {
        let (_dir, store) = store().await;
        assert!(store.root().join("video").is_dir());
        assert!(store.root().join("image").is_dir());
        assert!(store.root().join("tmp").is_dir());

        let u = url("https://x/a.mp4");
        let p1 = store.path_for(&u, ResourceKind::Video, None);
        let p2 = store.path_for(&u, ResourceKind::Video, None);
        assert_eq!(p1, p2);
        assert!(p1.to_string_lossy().ends_with(".mp4"));

        let variant = store.path_for(
            &url("https://x/pic"),
            ResourceKind::Image,
            Some(SizeVariant { width: 320, height: 240 }),
        );
        assert!(variant.to_string_lossy().ends_with("_320x240.jpg"));
        assert_ne!(p1, store.path_for(&url("https://x/b.mp4"), ResourceKind::Video, None));
    }

    #[tokio::test]
    async fn test_move_into_place() {
        let (dir, store) = store().await;
        let u = url("https://x/a.mp4");
        let temp = dir.path().join("download.tmp");
        std::fs::write(&temp, b"video bytes").unwrap();

        let dest = store.move_into_place(&temp, &u, ResourceKind::Video).await.unwrap();
        assert_eq!(dest, store.path_for(&u, ResourceKind::Video, None));
        assert!(!temp.exists());
        assert!(store.exists(&u, ResourceKind::Video).await);

        let info = store.info(&u, ResourceKind::Video).await.unwrap();
        assert_eq!(info.size_bytes, 11);
    }

    #[tokio::test]
    async fn test_move_missing_temp_is_precondition_error() {
        let (dir, store) = store().await;
        let err = store
            .move_into_place(&dir.path().join("nope"), &url("https://x/a.mp4"), ResourceKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::MissingTempFile(_)));
    }

    #[tokio::test]
    async fn test_zero_byte_file_self_heals() {
        let (_dir, store) = store().await;
        let u = url("https://x/empty.mp4");
        let path = store.path_for(&u, ResourceKind::Video, None);
        std::fs::write(&path, b"").unwrap();

        assert!(!store.exists(&u, ResourceKind::Video).await);
        assert!(!path.exists(), "zero-byte file should be deleted by the check");
    }

    #[tokio::test]
    async fn test_delete_is_best_effort() {
        let (_dir, store) = store().await;
        let u = url("https://x/a.jpg");
        store.write_bytes(&u, ResourceKind::Image, b"img").await.unwrap();

        assert!(store.delete(&u, ResourceKind::Image).await);
        assert!(!store.delete(&u, ResourceKind::Image).await);
        assert!(!store.exists(&u, ResourceKind::Image).await);
    }

    #[tokio::test]
    async fn test_read_range() {
        let (_dir, store) = store().await;
        let u = url("https://x/a.mp4");
        store.write_bytes(&u, ResourceKind::Video, b"0123456789").await.unwrap();

        let slice = store.read_range(&u, ResourceKind::Video, 3, 4).await.unwrap();
        assert_eq!(&slice[..], b"3456");
        let tail = store.read_range(&u, ResourceKind::Video, 8, 100).await.unwrap();
        assert_eq!(&tail[..], b"89");
        let past = store.read_range(&u, ResourceKind::Video, 10, 1).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn test_clear_by_kind_and_all() {
        let (_dir, store) = store().await;
        let v = url("https://x/a.mp4");
        let i = url("https://x/a.png");
        store.write_bytes(&v, ResourceKind::Video, b"v").await.unwrap();
        store.write_bytes(&i, ResourceKind::Image, b"i").await.unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 2);

        store.clear(Some(ResourceKind::Image)).await.unwrap();
        assert!(store.exists(&v, ResourceKind::Video).await);
        assert!(!store.exists(&i, ResourceKind::Image).await);
        assert!(store.root().join("image").is_dir());

        store.clear(None).await.unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(store.root().join("tmp").is_dir());
    }

    #[tokio::test]
    async fn test_stage_part_file() {
        let (_dir, store) = store().await;
        let u = url("https://x/a.mp4");
        assert!(matches!(
            store.stage(&u, ResourceKind::Video).await,
            Err(CacheError::MissingTempFile(_))
        ));

        std::fs::write(store.part_path(&u), b"body").unwrap();
        let staged = store.stage(&u, ResourceKind::Video).await.unwrap();
        assert!(store.has_staged(&u, ResourceKind::Video).await);
        assert!(!store.part_path(&u).exists());

        store.move_into_place(&staged, &u, ResourceKind::Video).await.unwrap();
        assert!(!store.has_staged(&u, ResourceKind::Video).await);
    }
}
