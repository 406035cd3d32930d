//! # Mediacache
//!
//! A progressive media cache. A remote image or video is downloaded once,
//! byte ranges are served to a player while the download is still in flight,
//! and the result is kept in a hot in-memory tier or a cold on-disk tier.
//!
//! ## Features
//!
//! - At most one physical transfer per URL, shared by any number of subscribers
//! - Pause, resume (across restarts) and cancel
//! - Range reads that are answered as soon as enough bytes have arrived
//! - Two-level memory cache with independent count and cost limits
//! - Content-addressed disk layout with self-healing of corrupt files
//!
//! ## Example
//!
//! ```no_run
//! use mediacache_engine::{CacheConfig, CacheTier, MediaCache, ResourceKind};
//!
//! # async fn run() -> mediacache_engine::Result<()> {
//! let cache = MediaCache::new(CacheConfig::default()).await?;
//! let url = "https://example.com/clip.mp4";
//!
//! let download = cache.download(url, ResourceKind::Video, CacheTier::Disk).await?;
//! let head = cache.read_range(url, 0, 64 * 1024).await?;
//! let bytes = head.read_to_end().await?;
//! println!("first {} bytes ready", bytes.len());
//! download.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod download;
pub mod error;
pub mod index;
pub mod manager;
pub mod memory;
pub mod resource;
pub mod storage;
pub mod stream;

pub use builder::CacheConfigBuilder;
pub use config::{CacheConfig, TransportConfig};
pub use download::{
    DownloadCoordinator, DownloadEvent, DownloadRequest, DownloadState, DownloadSubscription,
    HttpTransport, PassThrough, ResourceTransform, ResumeToken, Transport,
};
pub use error::{CacheError, Result};
pub use index::ResourceIndex;
pub use manager::{MediaCache, RangeRead, StoreSource};
pub use memory::{CacheStats, TieredMemoryCache};
pub use resource::{CacheTier, ResourceIdentity, ResourceKind, ResourceState, normalize_url};
pub use storage::{FileKvStore, FileStore, KeyValueStore, MemoryKvStore, SizeVariant, StoredFile};
pub use stream::{ContentInfo, ReadEvent, ReadHandle, ReadRequest, StreamFulfillmentEngine};
