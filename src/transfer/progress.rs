//! Per-artifact progress reporting.

use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{msg} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Receives progress for each artifact as it downloads.
pub trait ProgressObserver {
    /// Announces a new artifact of `total_bytes` (zero when unknown).
    fn start(&self, name: &str, total_bytes: u64) -> Box<dyn ArtifactProgress>;
}

/// Progress handle for one artifact download.
pub trait ArtifactProgress: Send {
    /// Records `bytes` more bytes written to disk.
    fn advance(&self, bytes: u64);

    /// Marks the artifact as finished, successfully or not.
    fn finish(self: Box<Self>, succeeded: bool);
}

/// Draws an `indicatif` progress bar per artifact on stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleProgress;

impl ProgressObserver for ConsoleProgress {
    fn start(&self, name: &str, total_bytes: u64) -> Box<dyn ArtifactProgress> {
        let bar = if total_bytes == 0 {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::new(total_bytes)
        };
        if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(name.to_owned());
        Box::new(bar)
    }
}

impl ArtifactProgress for ProgressBar {
    fn advance(&self, bytes: u64) {
        self.inc(bytes);
    }

    fn finish(self: Box<Self>, succeeded: bool) {
        if succeeded {
            ProgressBar::finish(&self);
        } else {
            self.abandon_with_message(format!("{} (failed)", self.message()));
        }
    }
}

/// Discards all progress; used when bars are disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentProgress;

impl ProgressObserver for SilentProgress {
    fn start(&self, _name: &str, _total_bytes: u64) -> Box<dyn ArtifactProgress> {
        Box::new(ProgressBar::hidden())
    }
}
