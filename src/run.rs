//! The backup run aggregate: which VM, where it lands, and how it finishes.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;

/// Format of the timestamp suffix appended to run directory names.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Extension appended to the run directory when it is archived.
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Where a finished backup ends up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DestinationMode {
    /// Keep the exported files in the local run directory.
    File,
    /// Archive the run directory, upload it, and remove the local copies.
    Cloud,
}

impl DestinationMode {
    /// Name used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for DestinationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end invocation covering exactly one VM and one destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupRun {
    vm_name: String,
    mode: DestinationMode,
    backup_root: Utf8PathBuf,
    dir_name: String,
}

impl BackupRun {
    /// Creates a run for `vm_name` started at `started_at`.
    ///
    /// The run directory is named after the VM with spaces replaced by
    /// underscores, followed by the start timestamp.
    #[must_use]
    pub fn new(
        vm_name: impl Into<String>,
        mode: DestinationMode,
        backup_root: impl Into<Utf8PathBuf>,
        started_at: NaiveDateTime,
    ) -> Self {
        let name: String = vm_name.into();
        let dir_name = format!(
            "{}_{}",
            name.replace(' ', "_"),
            started_at.format(RUN_TIMESTAMP_FORMAT)
        );
        Self {
            vm_name: name,
            mode,
            backup_root: backup_root.into(),
            dir_name,
        }
    }

    /// Name of the virtual machine being exported.
    #[must_use]
    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Selected destination mode.
    #[must_use]
    pub const fn mode(&self) -> DestinationMode {
        self.mode
    }

    /// Directory holding every run directory.
    #[must_use]
    pub fn backup_root(&self) -> &Utf8Path {
        &self.backup_root
    }

    /// Base name of the run directory.
    #[must_use]
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// Full path of the run directory.
    #[must_use]
    pub fn run_dir(&self) -> Utf8PathBuf {
        self.backup_root.join(&self.dir_name)
    }

    /// File name of the archive produced in cloud mode.
    #[must_use]
    pub fn archive_name(&self) -> String {
        format!("{}.{ARCHIVE_EXTENSION}", self.dir_name)
    }

    /// Full path of the archive produced in cloud mode.
    #[must_use]
    pub fn archive_path(&self) -> Utf8PathBuf {
        self.backup_root.join(self.archive_name())
    }
}
