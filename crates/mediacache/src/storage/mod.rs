//! # Storage
//!
//! On-disk persistence: the content-addressed file store and the key-value
//! substrate used for the resource index and paused transfer blobs.

pub mod file_store;
pub mod kv;

pub use file_store::{FileStore, SizeVariant, StoredFile};
pub use kv::{FileKvStore, KeyValueStore, MemoryKvStore};

pub(crate) use file_store::remove_quietly;
