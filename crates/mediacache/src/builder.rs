//! # Builder for CacheConfig
//!
//! Fluent construction of [`CacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mediacache_engine::CacheConfig;
//!
//! let config = CacheConfig::builder()
//!     .with_root_dir("/tmp/media")
//!     .with_memory_cost_limit(64 * 1024 * 1024)
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_header("Referer", "https://example.com/")
//!     .build();
//!
//! assert_eq!(config.memory_cost_limit, 64 * 1024 * 1024);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::{CacheConfig, TransportConfig};

/// Builder for creating CacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    /// Set the root cache directory
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.config.root_dir = root_dir.into();
        self
    }

    /// Set the entry limit of the encoded memory tier
    pub fn with_memory_count_limit(mut self, limit: usize) -> Self {
        self.config.memory_count_limit = limit;
        self
    }

    /// Set the byte limit of the decoded memory tier
    pub fn with_memory_cost_limit(mut self, limit: usize) -> Self {
        self.config.memory_cost_limit = limit;
        self
    }

    /// Enable or disable compression of the encoded memory tier
    pub fn with_memory_compression(mut self, enabled: bool) -> Self {
        self.config.compress_memory = enabled;
        self
    }

    /// Replace the whole transport configuration
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Set the overall timeout for the entire HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.connect_timeout = timeout;
        self
    }

    /// Set the read timeout (maximum time between receiving data chunks)
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.transport.read_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.transport.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.transport.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header; invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.transport.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.transport.headers = headers;
        self
    }

    /// Build the CacheConfig instance
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
