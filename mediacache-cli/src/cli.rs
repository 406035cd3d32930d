use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mediacache_engine::{CacheTier, ResourceKind};

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Progressive media cache",
    long_about = "Downloads images and videos once and keeps them in a local cache.\n\
                  \n\
                  Byte ranges can be read while a download is still running, downloads\n\
                  can be paused and picked up again later (also after a restart), and\n\
                  cached resources live either in memory or on disk."
)]
pub struct CliArgs {
    /// Cache root directory
    #[arg(
        short,
        long,
        global = true,
        help = "Cache root directory (default: <system temp dir>/mediacache)"
    )]
    pub root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Decoded memory tier size with optional unit (B, KB, MB, GB)
    #[arg(
        long,
        global = true,
        default_value = "32MB",
        help = "Byte limit of the decoded memory tier (B, KB, MB, GB). Use 0 for unlimited."
    )]
    pub memory_limit: String,

    /// Encoded memory tier entry limit
    #[arg(
        long,
        global = true,
        default_value = "64",
        help = "Entry limit of the encoded memory tier. Use 0 for unlimited."
    )]
    pub memory_entries: usize,

    /// Keep memory entries uncompressed
    #[arg(long, global = true, help = "Store memory entries without compression")]
    pub no_compression: bool,

    /// Overall timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests (0 disables it)"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "30",
        help = "Read timeout in seconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// Custom HTTP headers
    #[arg(
        short = 'H',
        long = "header",
        global = true,
        help = "Add custom HTTP header (format: 'Name: Value'). Can be used multiple times."
    )]
    pub headers: Vec<String>,

    /// Custom user agent
    #[arg(long, global = true, help = "User agent sent with every request")]
    pub user_agent: Option<String>,

    /// Do not follow redirects
    #[arg(long, global = true, help = "Fail instead of following HTTP redirects")]
    pub no_redirects: bool,

    /// Hide progress bars
    #[arg(long, global = true, help = "Do not show progress bars")]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download a resource into the cache, resuming a paused download if there is one
    Fetch {
        url: String,

        #[arg(short, long, value_enum, default_value_t = ResourceKind::Video)]
        kind: ResourceKind,

        #[arg(short, long, value_enum, default_value_t = CacheTier::Disk)]
        tier: CacheTier,

        /// Pause once this much has been written (B, KB, MB, GB)
        #[arg(long, help = "Pause the download after this many bytes, e.g. \"2MB\"")]
        pause_after: Option<String>,
    },

    /// Read a byte range, downloading the resource if it is not cached
    Read {
        url: String,

        #[arg(short, long, value_enum, default_value_t = ResourceKind::Video)]
        kind: ResourceKind,

        #[arg(long, default_value = "0")]
        offset: u64,

        /// Number of bytes with optional unit (B, KB, MB, GB)
        #[arg(short, long, default_value = "64KB")]
        length: String,

        /// Write the bytes to this file instead of printing a summary
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show what the cache knows about a resource
    State {
        url: String,

        #[arg(short, long, value_enum, default_value_t = ResourceKind::Video)]
        kind: ResourceKind,

        #[arg(short, long, value_enum, default_value_t = CacheTier::Disk)]
        tier: CacheTier,
    },

    /// List cached files
    Info,

    /// Cancel a paused download and delete its partial data
    Cancel { url: String },

    /// Remove a resource from every tier
    Evict { url: String },

    /// Remove every cached resource, or only those of one kind
    Clear {
        #[arg(value_enum)]
        kind: Option<ResourceKind>,
    },
}
