//! # Resource Types
//!
//! Identity and state types shared by every component of the cache.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CacheError, Result};

/// Kind of media a resource holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ResourceKind {
    Video,
    Image,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Video, ResourceKind::Image];

    /// Directory name used for this kind under the cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            ResourceKind::Video => "video",
            ResourceKind::Image => "image",
        }
    }

    /// Extension used when the URL does not carry one
    pub fn default_extension(&self) -> &'static str {
        match self {
            ResourceKind::Video => "mp4",
            ResourceKind::Image => "jpg",
        }
    }
}

/// Storage location of a cached resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CacheTier {
    #[default]
    None,
    Memory,
    Disk,
}

/// Existence state reported to a consumer asking for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Bytes fully received but not yet moved to their permanent location
    Uncached,
    /// Resource is available from memory or disk
    Cached,
    /// A transfer is in flight; attach to it
    Downloading,
    /// A transfer was paused and can be resumed
    Paused,
    /// Nothing is known about the resource
    None,
}

/// Persisted identity of a cached resource.
///
/// Equality and hashing use the URL only, so an upsert for the same URL
/// replaces the kind and tier in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub source_url: String,
    pub kind: ResourceKind,
    pub tier: CacheTier,
}

impl ResourceIdentity {
    pub fn new(source_url: impl Into<String>, kind: ResourceKind, tier: CacheTier) -> Self {
        Self {
            source_url: source_url.into(),
            kind,
            tier,
        }
    }
}

impl PartialEq for ResourceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.source_url == other.source_url
    }
}

impl Eq for ResourceIdentity {}

impl Hash for ResourceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_url.hash(state);
    }
}

// Hash of the identity is the hash of its URL, so set lookups by &str are sound.
impl Borrow<str> for ResourceIdentity {
    fn borrow(&self) -> &str {
        &self.source_url
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.source_url, self.kind, self.tier)
    }
}

/// Parse and normalize a source URL.
///
/// Scheme and host are lowercased by the parser and any fragment is dropped,
/// so two spellings of the same resource share one cache entry.
pub fn normalize_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|e| CacheError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CacheError::InvalidUrl(format!(
                "{raw}: unsupported scheme '{other}'"
            )));
        }
    }
    if url.host_str().is_none() {
        return Err(CacheError::InvalidUrl(format!("{raw}: missing host")));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Extension of the last path segment, lowercased
pub fn url_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Best-effort MIME type for a resource, used when no response header is available
pub fn guess_content_type(url: &Url, kind: ResourceKind) -> String {
    let mime = match url_extension(url).as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => match kind {
            ResourceKind::Video => "video/mp4",
            ResourceKind::Image => "image/jpeg",
        },
    };
    mime.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_equality_ignores_tier_and_kind() {
        let a = ResourceIdentity::new("https://x/a.mp4", ResourceKind::Video, CacheTier::Disk);
        let b = ResourceIdentity::new("https://x/a.mp4", ResourceKind::Image, CacheTier::Memory);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b.clone()));
        set.replace(b);
        let stored = set.get("https://x/a.mp4").unwrap();
        assert_eq!(stored.tier, CacheTier::Memory);
    }

    #[test]
    fn test_normalize_url() {
        let url = normalize_url("HTTPS://Example.COM/a/b.mp4#t=10").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a/b.mp4");

        assert!(matches!(
            normalize_url("not a url"),
            Err(CacheError::InvalidUrl(_))
        ));
        assert!(matches!(
            normalize_url("ftp://example.com/a.mp4"),
            Err(CacheError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_extension_and_content_type() {
        let url = Url::parse("https://x/path/clip.MOV?sig=1").unwrap();
        assert_eq!(url_extension(&url).as_deref(), Some("mov"));
        assert_eq!(guess_content_type(&url, ResourceKind::Video), "video/quicktime");

        let bare = Url::parse("https://x/stream").unwrap();
        assert_eq!(url_extension(&bare), None);
        assert_eq!(guess_content_type(&bare, ResourceKind::Image), "image/jpeg");
    }
}
