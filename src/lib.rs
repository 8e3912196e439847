//! Core library for the `vmbackup` virtual machine backup tool.
//!
//! A run exports one virtual machine from an ESXi host through the
//! export-lease API, downloads its disk artifacts into a timestamped local
//! directory, and either keeps them there or archives the directory and
//! uploads it to a WebDAV service such as Nextcloud.
//!
//! The hypervisor and the remote storage sit behind the [`Hypervisor`] and
//! [`RemoteStorage`] traits so the whole workflow runs against the scripted
//! doubles in [`test_support`].

pub mod config;
pub mod export;
pub mod hypervisor;
pub mod local;
pub mod logging;
pub mod orchestrator;
pub mod preflight;
pub mod run;
pub mod settings;
pub mod storage;
pub mod test_support;
pub mod transfer;
pub mod vsphere;
pub mod xml;

pub use config::{BackupConfig, ConfigError, HypervisorConfig, RemoteConfig, StorageConfig};
pub use export::{ArtifactDescriptor, ExportController, ExportError};
pub use hypervisor::{
    ArtifactStream, Hypervisor, HypervisorFuture, LeaseHandle, LeaseState, LeaseStatus, VmHandle,
};
pub use local::{LocalStore, LocalStoreError, RunDirectory, ScratchStore};
pub use orchestrator::{
    BackupError, BackupOrchestrator, Destination, Finalization, Phase, RunSummary,
};
pub use preflight::{PreflightChecker, PreflightError};
pub use run::{BackupRun, DestinationMode};
pub use settings::{BackupSettings, SettingsError};
pub use storage::{RemoteEntry, RemoteStorage, StorageError, WebDavStorage};
pub use transfer::{
    ArchiveError, ConsoleProgress, ProgressObserver, SilentProgress, TransferError,
    TransferPipeline, TransferPolicy, TransferReport,
};
pub use vsphere::{VsphereError, VsphereSession, authority};
