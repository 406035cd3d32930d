//! Step run between "bytes fully received" and "bytes considered cached".

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::Result;
use crate::resource::ResourceKind;

/// Converts a staged body into the artifact that gets cached.
///
/// Implementations may re-encode video or resize images. The returned path
/// must exist when the call returns; it is moved to the permanent location.
#[async_trait]
pub trait ResourceTransform: Send + Sync {
    async fn transform(&self, staged: &Path, kind: ResourceKind) -> Result<PathBuf>;
}

/// Caches bytes exactly as received
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl ResourceTransform for PassThrough {
    async fn transform(&self, staged: &Path, _kind: ResourceKind) -> Result<PathBuf> {
        Ok(staged.to_path_buf())
    }
}
