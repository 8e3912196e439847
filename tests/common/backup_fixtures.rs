//! Shared fixtures for backup behaviour tests.
//!
//! Included from each integration test with:
//!
//! ```rust
//! #[path = "common/backup_fixtures.rs"]
//! mod backup_fixtures;
//! ```

use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;
use vmbackup::{BackupRun, BackupSettings, DestinationMode};

/// Scaled-down stand-in for an exported disk image.
pub const LARGE_DISK_BYTES: u64 = 10 * 64 * 1024;

/// Size of a small artifact that does not end on a chunk boundary.
pub const SMALL_DISK_BYTES: u64 = 2 * 64 * 1024 + 17;

/// Temporary backup root removed when dropped.
pub struct BackupRoot {
    /// UTF-8 path of the backup root.
    pub path: Utf8PathBuf,
    _temp: TempDir,
}

/// Creates a backup root below a fresh temporary directory. The root itself
/// does not exist yet.
pub fn backup_root() -> BackupRoot {
    let temp = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(temp.path().join("backups")).expect("utf8 path");
    BackupRoot { path, _temp: temp }
}

/// Fixed start time used for run directory names.
pub fn started_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 15)
        .and_then(|date| date.and_hms_opt(14, 30, 0))
        .expect("valid timestamp")
}

/// Creates a run for `vm_name` below `root`.
pub fn run_for(vm_name: &str, mode: DestinationMode, root: &BackupRoot) -> BackupRun {
    BackupRun::new(vm_name, mode, root.path.clone(), started_at())
}

/// Settings with millisecond polling so lease tests stay fast.
pub fn fast_settings() -> BackupSettings {
    BackupSettings {
        lease_poll_interval_ms: 1,
        lease_timeout_secs: 5,
        progress: false,
        ..BackupSettings::default()
    }
}
