use std::time::Duration;

use mediacache_engine::{CacheConfig, CacheConfigBuilder};
use tracing::debug;

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::utils::{parse_headers, parse_size};

/// Build the cache configuration from command line arguments
pub fn build_cache_config(args: &CliArgs) -> Result<CacheConfig, AppError> {
    let memory_limit = parse_size(&args.memory_limit)?;
    let memory_limit = usize::try_from(memory_limit).map_err(|_| {
        AppError::InvalidInput(format!("Memory limit too large: {}", args.memory_limit))
    })?;

    let mut builder = CacheConfigBuilder::new()
        .with_memory_count_limit(args.memory_entries)
        .with_memory_cost_limit(memory_limit)
        .with_memory_compression(!args.no_compression)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_follow_redirects(!args.no_redirects);

    // Added on top of the default headers
    for (name, value) in parse_headers(&args.headers).iter() {
        if let Ok(value) = value.to_str() {
            builder = builder.with_header(name, value);
        }
    }

    if let Some(root) = &args.root {
        builder = builder.with_root_dir(root);
    }
    if let Some(user_agent) = &args.user_agent {
        builder = builder.with_user_agent(user_agent);
    }

    let config = builder.build();
    debug!(root = %config.root_dir.display(), "Cache configuration ready");
    Ok(config)
}
