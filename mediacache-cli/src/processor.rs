use std::path::Path;

use bytes::Bytes;
use mediacache_engine::{
    CacheError, CacheTier, DownloadEvent, DownloadSubscription, MediaCache, ResourceKind, ResourceState,
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::cli::Command;
use crate::error::AppError;
use crate::utils::progress::ProgressManager;
use crate::utils::{format_bytes, parse_size};

/// Run one subcommand against the cache
pub async fn process(
    cache: &MediaCache,
    command: Command,
    progress: &ProgressManager,
) -> Result<(), AppError> {
    match command {
        Command::Fetch {
            url,
            kind,
            tier,
            pause_after,
        } => {
            let pause_after = pause_after.as_deref().map(parse_size).transpose()?;
            fetch(cache, &url, kind, tier, pause_after, progress).await
        }
        Command::Read {
            url,
            kind,
            offset,
            length,
            output,
        } => {
            let length = parse_size(&length)?;
            read(cache, &url, kind, offset, length, output.as_deref(), progress).await
        }
        Command::State { url, kind, tier } => {
            let state = cache.request_resource(&url, kind, tier).await?;
            info!("{url}: {}", describe_state(state));
            Ok(())
        }
        Command::Info => show_info(cache).await,
        Command::Cancel { url } => {
            if cache.cancel(&url).await? {
                info!("Cancelled download of {url}");
            } else {
                info!("No download of {url} to cancel");
            }
            Ok(())
        }
        Command::Evict { url } => {
            if cache.evict(&url).await? {
                info!("Evicted {url}");
            } else {
                info!("{url} was not cached");
            }
            Ok(())
        }
        Command::Clear { kind } => {
            cache.clear_all(kind).await?;
            match kind {
                Some(kind) => info!("Cleared cached {}s", kind.dir_name()),
                None => info!("Cleared the cache"),
            }
            Ok(())
        }
    }
}

fn describe_state(state: ResourceState) -> &'static str {
    match state {
        ResourceState::Uncached => "downloaded, waiting to be moved into the cache",
        ResourceState::Cached => "cached",
        ResourceState::Downloading => "downloading",
        ResourceState::Paused => "paused, can be resumed",
        ResourceState::None => "not cached",
    }
}

async fn fetch(
    cache: &MediaCache,
    url: &str,
    kind: ResourceKind,
    tier: CacheTier,
    pause_after: Option<u64>,
    progress: &ProgressManager,
) -> Result<(), AppError> {
    let state = cache.request_resource(url, kind, tier).await?;
    if state == ResourceState::Cached {
        info!("{url} is already cached");
        return Ok(());
    }
    if state == ResourceState::Paused {
        info!("Resuming paused download of {url}");
    }

    let subscription = cache.download(url, kind, tier).await?;
    follow(cache, url, subscription, pause_after, progress).await
}

/// Drive the progress bar until the download ends. Ctrl-C (or reaching
/// `pause_after` bytes) pauses the transfer so a later fetch can resume it.
async fn follow(
    cache: &MediaCache,
    url: &str,
    mut subscription: DownloadSubscription,
    pause_after: Option<u64>,
    progress: &ProgressManager,
) -> Result<(), AppError> {
    let bar = progress.add_download(url);
    let mut pausing = false;

    loop {
        let event = tokio::select! {
            event = subscription.recv() => event,
            _ = tokio::signal::ctrl_c(), if !pausing => {
                info!("Interrupted, pausing download");
                pausing = true;
                cache.pause(url).await?;
                continue;
            }
        };
        let Some(event) = event else {
            return Err(AppError::Cache(CacheError::Cancelled));
        };
        bar.handle_event(&event);

        match event {
            DownloadEvent::Progress { written, .. } => {
                if !pausing && pause_after.is_some_and(|limit| written >= limit) {
                    pausing = true;
                    cache.pause(url).await?;
                }
            }
            DownloadEvent::Reset => warn!("Server did not resume the transfer, restarting from zero"),
            DownloadEvent::Paused { resumable } => {
                info!(
                    "Paused {url} ({}); run fetch again to continue",
                    if resumable { "resumable" } else { "will restart" }
                );
                return Ok(());
            }
            DownloadEvent::Finished { path, size } => {
                match path {
                    Some(path) => info!("Cached {url} at {} ({})", path.display(), format_bytes(size)),
                    None => info!("Cached {url} in memory ({})", format_bytes(size)),
                }
                return Ok(());
            }
            DownloadEvent::Failed(e) => return Err(e.into()),
            DownloadEvent::Started { .. } => {}
        }
    }
}

async fn read(
    cache: &MediaCache,
    url: &str,
    kind: ResourceKind,
    offset: u64,
    length: u64,
    output: Option<&Path>,
    progress: &ProgressManager,
) -> Result<(), AppError> {
    let state = cache.request_resource(url, kind, CacheTier::Disk).await?;

    // Uncached resources are downloaded and read while the bytes arrive
    let subscription = match state {
        ResourceState::Cached => None,
        _ => Some(cache.download(url, kind, CacheTier::Disk).await?),
    };

    let range = cache.read_range(url, offset, length).await?;
    if let Some(info) = &range.info {
        info!(
            "Content type: {}, length: {}",
            info.content_type.as_deref().unwrap_or("unknown"),
            info.content_length
                .map(format_bytes)
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
    if !range.is_complete() {
        info!("{} available now, waiting for the rest", format_bytes(range.initial.len() as u64));
    }
    let bytes = range.read_to_end().await?;
    write_range(url, offset, &bytes, output).await?;

    match subscription {
        Some(subscription) => follow(cache, url, subscription, None, progress).await,
        None => Ok(()),
    }
}

async fn write_range(url: &str, offset: u64, bytes: &Bytes, output: Option<&Path>) -> Result<(), AppError> {
    match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            info!("Wrote {} of {url} at offset {offset} to {}", format_bytes(bytes.len() as u64), path.display());
        }
        None => {
            let preview: String = bytes.iter().take(16).map(|b| format!("{b:02x}")).collect();
            info!("Read {} of {url} at offset {offset}: {preview}", format_bytes(bytes.len() as u64));
        }
    }
    Ok(())
}

async fn show_info(cache: &MediaCache) -> Result<(), AppError> {
    let files = cache.cache_info().await?;
    let total: u64 = files.iter().map(|f| f.size_bytes).sum();
    info!("{} cached files, {} on disk", files.len(), format_bytes(total));
    for file in &files {
        info!(
            "  {} {:>10}  {}",
            file.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_bytes(file.size_bytes),
            file.path.display()
        );
    }

    let stats = cache.memory_stats();
    info!(
        "Memory: {} encoded, {} decoded ({}), {} hits, {} misses, {} evictions",
        stats.encoded_entries,
        stats.decoded_entries,
        format_bytes(stats.decoded_cost as u64),
        stats.hits,
        stats.misses,
        stats.evictions
    );
    Ok(())
}
