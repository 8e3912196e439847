//! Remote storage checks performed before any hypervisor work.
//!
//! A cloud-mode run must not spend an hour exporting disks only to discover
//! that the upload target is unreachable or read-only. The checker verifies
//! connectivity, ensures the target directory exists, and proves write access
//! by uploading and deleting a zero-byte probe file.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::local::LocalStore;
use crate::storage::{RemoteStorage, STATUS_UNAUTHORIZED, StorageError, remote_join};

/// Errors raised while verifying remote storage.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum PreflightError {
    /// Raised when the service cannot be reached.
    #[error("remote storage is unreachable: {message}")]
    Unreachable {
        /// Transport error message.
        message: String,
    },
    /// Raised when the service rejects the configured credentials.
    #[error("remote storage rejected the configured credentials")]
    AuthenticationFailed,
    /// Raised when the target directory is missing and could not be created.
    #[error("remote directory {dir} does not exist and could not be created")]
    DirectoryUnavailable {
        /// Remote directory that was requested.
        dir: String,
    },
    /// Raised when the probe file cannot be written to the target directory.
    #[error("no write permission in remote directory {dir}: {source}")]
    WritePermissionDenied {
        /// Remote directory that was probed.
        dir: String,
        /// Upload failure reported by the service.
        #[source]
        source: StorageError,
    },
    /// Raised when the local probe file cannot be created.
    #[error("failed to create local probe file: {message}")]
    LocalProbe {
        /// Human-readable error message.
        message: String,
    },
    /// Raised for any other storage failure during the checks.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Verifies that a remote directory is reachable and writable.
pub struct PreflightChecker<'a, S: RemoteStorage> {
    storage: &'a S,
    scratch: &'a LocalStore,
}

impl<'a, S: RemoteStorage> PreflightChecker<'a, S> {
    /// Creates a checker that stages its probe file in `scratch`.
    #[must_use]
    pub const fn new(storage: &'a S, scratch: &'a LocalStore) -> Self {
        Self { storage, scratch }
    }

    /// Runs every check against `remote_dir`.
    ///
    /// Probe files are removed locally and remotely on every path, including
    /// failures; cleanup problems are logged and never replace the primary
    /// result.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`PreflightError`].
    pub async fn verify(&self, remote_dir: &str) -> Result<(), PreflightError> {
        self.check_connectivity().await?;
        self.ensure_directory(remote_dir).await?;
        self.probe_write(remote_dir).await?;
        info!(remote_dir, "remote storage preflight passed");
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), PreflightError> {
        match self.storage.info("/").await {
            Ok(_) => Ok(()),
            Err(StorageError::NotConnected { message }) => {
                Err(PreflightError::Unreachable { message })
            }
            Err(StorageError::Status { code, .. }) if code == STATUS_UNAUTHORIZED => {
                Err(PreflightError::AuthenticationFailed)
            }
            Err(err) => Err(PreflightError::Storage(err)),
        }
    }

    async fn ensure_directory(&self, remote_dir: &str) -> Result<(), PreflightError> {
        if self.storage.exists(remote_dir).await? {
            return Ok(());
        }

        info!(remote_dir, "creating remote directory");
        if let Err(err) = self.storage.mkdir(remote_dir).await {
            warn!(remote_dir, error = %err, "remote directory creation failed");
        }

        if self.storage.exists(remote_dir).await? {
            Ok(())
        } else {
            Err(PreflightError::DirectoryUnavailable {
                dir: remote_dir.to_owned(),
            })
        }
    }

    async fn probe_write(&self, remote_dir: &str) -> Result<(), PreflightError> {
        let probe_name = probe_file_name(SystemTime::now(), Uuid::new_v4());
        let remote_path = remote_join(remote_dir, &probe_name);

        let local_path = self
            .scratch
            .write_empty_file(&probe_name)
            .map_err(|err| PreflightError::LocalProbe {
                message: err.to_string(),
            })?;

        let upload = self.storage.upload(&local_path, &remote_path).await;
        self.remove_probe(&probe_name, &remote_path).await;

        upload.map_err(|source| PreflightError::WritePermissionDenied {
            dir: remote_dir.to_owned(),
            source,
        })
    }

    async fn remove_probe(&self, probe_name: &str, remote_path: &str) {
        match self.storage.exists(remote_path).await {
            Ok(true) => {
                if let Err(err) = self.storage.delete(remote_path).await {
                    warn!(path = remote_path, error = %err, "failed to delete remote probe file");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(path = remote_path, error = %err, "failed to check remote probe file");
            }
        }

        if let Err(err) = self.scratch.remove_file_if_exists(probe_name) {
            warn!(error = %err, "failed to delete local probe file");
        }
    }
}

/// Builds a hidden probe file name that cannot collide across runs.
fn probe_file_name(now: SystemTime, nonce: Uuid) -> String {
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!(".write_test_{seconds}_{}.tmp", nonce.simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn probe_names_are_hidden_and_unique() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let first = probe_file_name(now, Uuid::new_v4());
        let second = probe_file_name(now, Uuid::new_v4());

        assert!(first.starts_with(".write_test_1700000000_"), "got {first}");
        assert!(first.ends_with(".tmp"));
        assert_ne!(first, second);
    }
}
