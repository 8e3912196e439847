//! Artifact download pipeline.
//!
//! Artifacts are downloaded one at a time in enumeration order, streamed in
//! chunks through a buffered writer so memory stays bounded regardless of
//! disk size. A failed artifact is recorded and the pipeline moves on to the
//! next one; whether that failure aborts the run is decided by the caller's
//! [`TransferPolicy`].

use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use crate::export::ArtifactDescriptor;
use crate::hypervisor::{Hypervisor, LeaseHandle};
use crate::local::{LocalStoreError, RunDirectory};

pub mod archive;
pub mod progress;

pub use archive::ArchiveError;
pub use progress::{ArtifactProgress, ConsoleProgress, ProgressObserver, SilentProgress};

/// Capacity of the write buffer placed in front of each artifact file.
pub const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

/// Maximum interval between lease progress reports during downloads.
pub const LEASE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How individual artifact failures affect the run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransferPolicy {
    /// Keep going and report partial success.
    #[default]
    BestEffort,
    /// Abort the run when any artifact fails.
    FailFast,
}

/// Errors raised while downloading a single artifact.
#[derive(Debug, Error)]
pub enum TransferError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the local artifact file cannot be created.
    #[error(transparent)]
    Local(#[from] LocalStoreError),
    /// Raised when the download cannot be started or is interrupted.
    #[error("download failed: {0}")]
    Source(#[source] E),
    /// Raised when writing to the local file fails.
    #[error("failed to write artifact: {0}")]
    Write(String),
    /// Raised when the bytes written differ from the declared size.
    #[error("size mismatch: expected {expected} bytes, wrote {written}")]
    SizeMismatch {
        /// Declared size.
        expected: u64,
        /// Bytes actually written.
        written: u64,
    },
}

/// An artifact that downloaded completely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompletedArtifact {
    /// File name of the artifact.
    pub name: String,
    /// Bytes written to disk.
    pub bytes: u64,
}

/// An artifact that failed to download.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailedArtifact {
    /// File name of the artifact.
    pub name: String,
    /// Human-readable failure reason.
    pub reason: String,
}

/// Outcome of downloading every artifact of an export.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferReport {
    /// Artifacts written successfully, in download order.
    pub completed: Vec<CompletedArtifact>,
    /// Artifacts that failed, in download order.
    pub failed: Vec<FailedArtifact>,
}

impl TransferReport {
    /// Whether every artifact downloaded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total bytes written across completed artifacts.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.completed.iter().map(|artifact| artifact.bytes).sum()
    }
}

/// Downloads export artifacts into a run directory.
pub struct TransferPipeline<'a, H: Hypervisor> {
    hypervisor: &'a H,
    lease: &'a LeaseHandle,
    observer: &'a dyn ProgressObserver,
    keepalive_interval: Duration,
}

impl<'a, H: Hypervisor> TransferPipeline<'a, H> {
    /// Creates a pipeline that downloads through `hypervisor` while holding
    /// `lease`.
    #[must_use]
    pub const fn new(
        hypervisor: &'a H,
        lease: &'a LeaseHandle,
        observer: &'a dyn ProgressObserver,
    ) -> Self {
        Self {
            hypervisor,
            lease,
            observer,
            keepalive_interval: LEASE_KEEPALIVE_INTERVAL,
        }
    }

    /// Overrides the interval between lease progress reports.
    #[must_use]
    pub const fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Downloads every artifact in order, recording failures instead of
    /// stopping.
    pub async fn download_all(
        &self,
        artifacts: &[ArtifactDescriptor],
        destination: &RunDirectory,
    ) -> TransferReport {
        let total_bytes = artifacts.iter().map(|artifact| artifact.size_bytes).sum();
        let mut keepalive = LeaseKeepAlive::new(total_bytes, self.keepalive_interval);
        let mut report = TransferReport::default();

        for artifact in artifacts {
            info!(
                artifact = %artifact.name,
                size_bytes = artifact.size_bytes,
                "downloading artifact"
            );
            let progress = self.observer.start(&artifact.name, artifact.size_bytes);
            match self
                .download_one(artifact, destination, progress.as_ref(), &mut keepalive)
                .await
            {
                Ok(bytes) => {
                    progress.finish(true);
                    info!(artifact = %artifact.name, bytes, "artifact downloaded");
                    report.completed.push(CompletedArtifact {
                        name: artifact.name.clone(),
                        bytes,
                    });
                }
                Err(err) => {
                    progress.finish(false);
                    warn!(artifact = %artifact.name, error = %err, "artifact download failed");
                    report.failed.push(FailedArtifact {
                        name: artifact.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.report_progress(100).await;
        report
    }

    async fn download_one(
        &self,
        artifact: &ArtifactDescriptor,
        destination: &RunDirectory,
        progress: &dyn ArtifactProgress,
        keepalive: &mut LeaseKeepAlive,
    ) -> Result<u64, TransferError<H::Error>> {
        let file = destination.create_file(&artifact.name)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
        let mut stream = self
            .hypervisor
            .open_artifact(&artifact.source_url)
            .await
            .map_err(TransferError::Source)?;

        let mut written = 0_u64;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(TransferError::Source)?;
            writer
                .write_all(&bytes)
                .await
                .map_err(|err| TransferError::Write(err.to_string()))?;
            let length = bytes.len() as u64;
            written += length;
            progress.advance(length);
            if let Some(percent) = keepalive.record(length) {
                self.report_progress(percent).await;
            }
        }
        writer
            .shutdown()
            .await
            .map_err(|err| TransferError::Write(err.to_string()))?;

        if artifact.size_bytes != 0 && written != artifact.size_bytes {
            return Err(TransferError::SizeMismatch {
                expected: artifact.size_bytes,
                written,
            });
        }
        Ok(written)
    }

    async fn report_progress(&self, percent: u8) {
        if let Err(err) = self.hypervisor.lease_progress(self.lease, percent).await {
            warn!(lease = %self.lease.id, error = %err, "failed to report lease progress");
        }
    }
}

/// Tracks transferred bytes and decides when the lease needs a progress
/// report to stay alive.
#[derive(Debug)]
struct LeaseKeepAlive {
    total_bytes: u64,
    transferred: u64,
    interval: Duration,
    last_report: Instant,
}

impl LeaseKeepAlive {
    fn new(total_bytes: u64, interval: Duration) -> Self {
        Self {
            total_bytes,
            transferred: 0,
            interval,
            last_report: Instant::now(),
        }
    }

    /// Records `bytes` and returns the percentage to report when the
    /// interval has elapsed.
    fn record(&mut self, bytes: u64) -> Option<u8> {
        self.transferred = self.transferred.saturating_add(bytes);
        if self.last_report.elapsed() < self.interval {
            return None;
        }
        self.last_report = Instant::now();
        Some(self.percent())
    }

    fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let scaled = u128::from(self.transferred) * 100;
        let percent = scaled.checked_div(u128::from(self.total_bytes)).unwrap_or(0);
        u8::try_from(percent.min(99)).unwrap_or(99)
    }
}
