use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Settings for the HTTP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Overall timeout for the entire HTTP request, zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            // Media bodies can take a long time; bound stalls instead.
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: TransportConfig::get_default_headers(),
        }
    }
}

impl TransportConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        // Byte offsets must refer to the stored representation, so no
        // content coding is negotiated.
        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}

/// Configuration of a [`MediaCache`](crate::MediaCache)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory holding one directory per resource kind
    pub root_dir: PathBuf,

    /// Maximum number of entries in the encoded memory tier, 0 for unbounded
    pub memory_count_limit: usize,

    /// Maximum total cost in bytes of the decoded memory tier, 0 for unbounded
    pub memory_cost_limit: usize,

    /// Whether the encoded memory tier stores compressed bytes
    pub compress_memory: bool,

    /// HTTP transport settings
    pub transport: TransportConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("mediacache"),
            memory_count_limit: 64,
            memory_cost_limit: 32 * 1024 * 1024, // 32 MiB
            compress_memory: true,
            transport: TransportConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> crate::builder::CacheConfigBuilder {
        crate::builder::CacheConfigBuilder::new()
    }

    /// Directory of the key-value substrate records
    pub fn state_dir(&self) -> PathBuf {
        self.root_dir.join("state")
    }
}
