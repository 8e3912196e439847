//! Orchestrates an end-to-end backup run.
//!
//! The orchestrator sequences remote storage preflight, hypervisor login,
//! the export lease, artifact downloads, and (in cloud mode) archiving and
//! upload. Progress through the run is tracked as an explicit [`Phase`] so
//! teardown knows exactly which resources are held: an acquired lease is
//! completed exactly once and an established session is closed, whatever
//! the outcome of the run.

use std::fmt::{self, Display};

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::export::{ExportController, ExportError};
use crate::hypervisor::{Hypervisor, LeaseHandle};
use crate::local::{LocalStore, LocalStoreError, ScratchStore};
use crate::preflight::{PreflightChecker, PreflightError};
use crate::run::BackupRun;
use crate::settings::BackupSettings;
use crate::storage::{RemoteStorage, StorageError, remote_join};
use crate::transfer::{
    ArchiveError, FailedArtifact, ProgressObserver, SilentProgress, TransferPipeline,
    TransferPolicy, TransferReport, archive,
};

/// Errors surfaced while performing a backup run.
#[derive(Debug, Error)]
pub enum BackupError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the remote storage preflight fails.
    #[error("remote storage preflight failed: {0}")]
    Preflight(#[from] PreflightError),
    /// Raised when a hypervisor call fails.
    #[error("hypervisor call '{action}' failed: {source}")]
    Hypervisor {
        /// Operation that failed.
        action: &'static str,
        /// Error reported by the hypervisor session.
        #[source]
        source: E,
    },
    /// Raised when no VM has the requested name.
    #[error("virtual machine '{name}' not found")]
    VmNotFound {
        /// Name that was searched for.
        name: String,
    },
    /// Raised when the export lease enters an error state.
    #[error("export lease failed: {message}")]
    LeaseFailed {
        /// Hypervisor-provided error message.
        message: String,
    },
    /// Raised when the export lease does not become ready in time.
    #[error("export lease not ready after {waited_secs}s")]
    LeaseTimeout {
        /// Seconds waited before giving up.
        waited_secs: u64,
    },
    /// Raised when a device URL cannot be mapped to an artifact.
    #[error("invalid device URL {url}")]
    InvalidArtifact {
        /// Offending URL.
        url: String,
    },
    /// Raised when local backup storage fails.
    #[error(transparent)]
    LocalStorage(#[from] LocalStoreError),
    /// Raised under the fail-fast policy when any artifact failed.
    #[error("{} of the exported artifacts failed to download: {}", .failed.len(), describe_failures(.failed))]
    IncompleteTransfer {
        /// Artifacts that failed.
        failed: Vec<FailedArtifact>,
    },
    /// Raised when the run directory cannot be archived.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// Raised when the archive cannot be uploaded. Local copies are kept.
    #[error("failed to upload {archive}: {source}")]
    Upload {
        /// Local archive that was kept.
        archive: Utf8PathBuf,
        /// Failure reported by remote storage.
        #[source]
        source: StorageError,
    },
    /// Raised when local copies cannot be removed after a successful upload.
    #[error("uploaded archive but failed to remove local copies: {message}")]
    Cleanup {
        /// Human-readable description of the failure.
        message: String,
    },
    /// Raised when teardown fails after the run itself succeeded.
    #[error("failed to release hypervisor resources: {message}")]
    Teardown {
        /// Description of each teardown failure.
        message: String,
    },
    /// Raised when teardown fails after the run had already failed.
    #[error("{primary} (teardown also failed: {note})")]
    TeardownAfterFailure {
        /// Rendered error that aborted the run.
        primary: String,
        /// Description of each teardown failure.
        note: String,
    },
}

impl<E> From<ExportError<E>> for BackupError<E>
where
    E: std::error::Error + 'static,
{
    fn from(err: ExportError<E>) -> Self {
        match err {
            ExportError::VmNotFound { name } => Self::VmNotFound { name },
            ExportError::LeaseFailed { message } => Self::LeaseFailed { message },
            ExportError::LeaseTimeout { waited_secs } => Self::LeaseTimeout { waited_secs },
            ExportError::InvalidDeviceUrl { url } => Self::InvalidArtifact { url },
            ExportError::Hypervisor { action, source } => Self::Hypervisor { action, source },
        }
    }
}

fn describe_failures(failed: &[FailedArtifact]) -> String {
    failed
        .iter()
        .map(|artifact| format!("{} ({})", artifact.name, artifact.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where finished backups go.
#[derive(Debug)]
pub enum Destination<S> {
    /// Keep the run directory on local storage.
    Local,
    /// Archive, upload to `remote_dir`, and remove local copies.
    Cloud {
        /// Remote storage service.
        storage: S,
        /// Remote directory receiving archives.
        remote_dir: String,
    },
}

/// Resources held at each point of a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Nothing acquired yet.
    Idle,
    /// Remote storage verified; no hypervisor session.
    Preflighted,
    /// Logged in to the hypervisor.
    Connected,
    /// Lease acquired and being waited on.
    Exporting {
        /// Lease held by the run.
        lease: LeaseHandle,
    },
    /// Lease ready and artifacts enumerated.
    Leased {
        /// Lease held by the run.
        lease: LeaseHandle,
    },
    /// Every artifact attempted.
    Downloaded {
        /// Lease held by the run.
        lease: LeaseHandle,
    },
    /// Backup kept locally or uploaded.
    Finalized {
        /// Lease held by the run.
        lease: LeaseHandle,
    },
}

impl Phase {
    /// Lease that must be completed during teardown.
    #[must_use]
    pub const fn lease(&self) -> Option<&LeaseHandle> {
        match self {
            Self::Idle | Self::Preflighted | Self::Connected => None,
            Self::Exporting { lease }
            | Self::Leased { lease }
            | Self::Downloaded { lease }
            | Self::Finalized { lease } => Some(lease),
        }
    }

    /// Whether a hypervisor session must be closed during teardown.
    #[must_use]
    pub const fn holds_session(&self) -> bool {
        !matches!(self, Self::Idle | Self::Preflighted)
    }
}

/// Where the backup of a successful run ended up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Finalization {
    /// Artifacts kept in the local run directory.
    Retained {
        /// Path of the run directory.
        run_dir: Utf8PathBuf,
    },
    /// Archive uploaded and local copies removed.
    Uploaded {
        /// File name of the uploaded archive.
        archive_name: String,
        /// Remote path of the uploaded archive.
        remote_path: String,
    },
}

/// Result of a successful run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSummary {
    /// Name of the exported VM.
    pub vm_name: String,
    /// Where the backup ended up.
    pub finalization: Finalization,
    /// Per-artifact download results.
    pub transfer: TransferReport,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.finalization {
            Finalization::Retained { run_dir } => {
                write!(f, "backup of {} saved to {run_dir}", self.vm_name)?;
            }
            Finalization::Uploaded { remote_path, .. } => {
                write!(f, "backup of {} uploaded to {remote_path}", self.vm_name)?;
            }
        }
        if !self.transfer.is_complete() {
            write!(
                f,
                " ({} artifacts failed: {})",
                self.transfer.failed.len(),
                describe_failures(&self.transfer.failed)
            )?;
        }
        Ok(())
    }
}

/// Executes backup runs against a hypervisor and a destination.
pub struct BackupOrchestrator<H, S> {
    hypervisor: H,
    destination: Destination<S>,
    host: String,
    settings: BackupSettings,
    progress: Box<dyn ProgressObserver>,
}

impl<H, S> BackupOrchestrator<H, S>
where
    H: Hypervisor,
    S: RemoteStorage,
{
    /// Creates an orchestrator that substitutes `host` into device URLs.
    #[must_use]
    pub fn new(hypervisor: H, destination: Destination<S>, host: impl Into<String>) -> Self {
        Self {
            hypervisor,
            destination,
            host: host.into(),
            settings: BackupSettings::default(),
            progress: Box::new(SilentProgress),
        }
    }

    /// Overrides the runtime settings.
    #[must_use]
    pub fn with_settings(mut self, settings: BackupSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Overrides the progress observer.
    #[must_use]
    pub fn with_progress(mut self, progress: Box<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs the backup described by `run`.
    ///
    /// Teardown is always attempted. When it fails after a successful run the
    /// failure is surfaced as [`BackupError::Teardown`]; after a failed run it
    /// is appended to the primary error.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] describing the first failure.
    pub async fn execute(&mut self, run: &BackupRun) -> Result<RunSummary, BackupError<H::Error>> {
        info!(vm = run.vm_name(), destination = %run.mode(), "starting backup run");
        let mut phase = Phase::Idle;
        let outcome = self.advance(run, &mut phase).await;
        let teardown = self.release(&phase).await;

        match (outcome, teardown) {
            (Ok(summary), None) => {
                info!(vm = %summary.vm_name, "backup run finished");
                Ok(summary)
            }
            (Ok(_), Some(message)) => Err(BackupError::Teardown { message }),
            (Err(err), None) => Err(err),
            (Err(err), Some(note)) => Err(BackupError::TeardownAfterFailure {
                primary: err.to_string(),
                note,
            }),
        }
    }

    async fn advance(
        &mut self,
        run: &BackupRun,
        phase: &mut Phase,
    ) -> Result<RunSummary, BackupError<H::Error>> {
        if let Destination::Cloud {
            storage,
            remote_dir,
        } = &self.destination
        {
            info!(remote_dir = %remote_dir, "verifying remote storage");
            let scratch = ScratchStore::create()?;
            PreflightChecker::new(storage, scratch.store())
                .verify(remote_dir)
                .await?;
            *phase = Phase::Preflighted;
        }

        let local = LocalStore::open(run.backup_root())?;

        self.hypervisor
            .connect()
            .await
            .map_err(|source| BackupError::Hypervisor {
                action: "connect",
                source,
            })?;
        *phase = Phase::Connected;

        let controller = ExportController::new(&self.hypervisor, &self.host)
            .with_poll_interval(self.settings.lease_poll_interval())
            .with_timeout(self.settings.lease_timeout());
        let vm = controller.find_vm(run.vm_name()).await?;
        let lease = controller.request_lease(&vm).await?;
        *phase = Phase::Exporting {
            lease: lease.clone(),
        };

        let device_urls = controller.wait_until_ready(&lease).await?;
        let artifacts = controller.enumerate_artifacts(&device_urls).await?;
        *phase = Phase::Leased {
            lease: lease.clone(),
        };

        let run_dir = local.create_run_dir(run.dir_name())?;
        info!(run_dir = %run_dir.path(), artifacts = artifacts.len(), "downloading artifacts");
        let report = TransferPipeline::new(&self.hypervisor, &lease, self.progress.as_ref())
            .with_keepalive_interval(self.settings.lease_keepalive_interval())
            .download_all(&artifacts, &run_dir)
            .await;
        *phase = Phase::Downloaded {
            lease: lease.clone(),
        };

        if !report.is_complete() {
            if self.settings.transfer_policy() == TransferPolicy::FailFast {
                return Err(BackupError::IncompleteTransfer {
                    failed: report.failed,
                });
            }
            warn!(
                failed = report.failed.len(),
                "continuing with a partial backup"
            );
        }

        let finalization = match &self.destination {
            Destination::Local => Finalization::Retained {
                run_dir: run.run_dir(),
            },
            Destination::Cloud {
                storage,
                remote_dir,
            } => archive_and_upload(storage, remote_dir, run, &local).await?,
        };
        *phase = Phase::Finalized { lease };

        Ok(RunSummary {
            vm_name: run.vm_name().to_owned(),
            finalization,
            transfer: report,
        })
    }

    async fn release(&mut self, phase: &Phase) -> Option<String> {
        let mut failures = Vec::new();

        if let Some(lease) = phase.lease() {
            if let Err(err) = self.hypervisor.complete_lease(lease.clone()).await {
                warn!(lease = %lease.id, error = %err, "failed to complete export lease");
                failures.push(format!("lease completion: {err}"));
            }
        }

        if phase.holds_session() {
            if let Err(err) = self.hypervisor.disconnect().await {
                warn!(error = %err, "failed to close hypervisor session");
                failures.push(format!("logout: {err}"));
            }
        }

        (!failures.is_empty()).then(|| failures.join("; "))
    }
}

async fn archive_and_upload<S, E>(
    storage: &S,
    remote_dir: &str,
    run: &BackupRun,
    local: &LocalStore,
) -> Result<Finalization, BackupError<E>>
where
    S: RemoteStorage,
    E: std::error::Error + 'static,
{
    let archive_path = run.archive_path();
    let archive_name = run.archive_name();
    archive::create_archive_blocking(
        run.run_dir(),
        archive_path.clone(),
        run.dir_name().to_owned(),
    )
    .await?;

    let remote_path = remote_join(remote_dir, &archive_name);
    info!(archive = %archive_path, remote = %remote_path, "uploading archive");
    storage
        .upload(&archive_path, &remote_path)
        .await
        .map_err(|source| BackupError::Upload {
            archive: archive_path.clone(),
            source,
        })?;

    local
        .remove_file_if_exists(&archive_name)
        .and_then(|()| local.remove_dir_if_exists(run.dir_name()))
        .map_err(|err| BackupError::Cleanup {
            message: err.to_string(),
        })?;
    info!(remote = %remote_path, "local copies removed after upload");

    Ok(Finalization::Uploaded {
        archive_name,
        remote_path,
    })
}
