use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mediacache_engine::DownloadEvent;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    disabled: bool,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            disabled: false,
        }
    }

    pub fn new_disabled() -> Self {
        Self {
            multi: MultiProgress::new(),
            disabled: true,
        }
    }

    /// Create a bar following one download
    pub fn add_download(&self, url: &str) -> DownloadBar {
        if self.disabled {
            return DownloadBar { bar: None };
        }
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(download_style());
        bar.set_message(format!("Downloading {url}"));
        bar.enable_steady_tick(Duration::from_millis(500));
        DownloadBar { bar: Some(bar) }
    }
}

/// Progress bar driven by [`DownloadEvent`]s
pub struct DownloadBar {
    bar: Option<ProgressBar>,
}

impl DownloadBar {
    pub fn handle_event(&self, event: &DownloadEvent) {
        let Some(bar) = &self.bar else {
            return;
        };
        match event {
            DownloadEvent::Started { expected } => {
                if let Some(total) = expected {
                    bar.set_length(*total);
                }
            }
            DownloadEvent::Progress {
                written, expected, ..
            } => {
                if let Some(total) = expected {
                    bar.set_length(*total);
                }
                bar.set_position(*written);
            }
            DownloadEvent::Reset => {
                bar.set_position(0);
                bar.reset_eta();
            }
            DownloadEvent::Paused { resumable } => {
                let note = if *resumable { "resumable" } else { "will restart" };
                bar.abandon_with_message(format!("Paused ({note})"));
            }
            DownloadEvent::Finished { size, .. } => {
                bar.set_length(*size);
                bar.set_position(*size);
                bar.finish_with_message("Finished");
            }
            DownloadEvent::Failed(e) => {
                bar.abandon_with_message(format!("Failed: {e}"));
            }
        }
    }
}
