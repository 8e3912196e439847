//! Local backup storage confined to the configured backup root.
//!
//! Every filesystem operation goes through a `cap-std` directory handle, so
//! artifact names taken from hypervisor URLs can never write outside the
//! backup root.

use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tempfile::TempDir;
use thiserror::Error;

/// Errors raised by local backup storage.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LocalStoreError {
    /// Raised when the backup root cannot be created or opened.
    #[error("failed to open backup directory {path}: {message}")]
    Root {
        /// Backup root that was requested.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when an entry below the backup root cannot be accessed.
    #[error("local storage operation failed for {path}: {message}")]
    Io {
        /// Path of the entry that failed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Handle on the directory receiving per-run backups.
#[derive(Debug)]
pub struct LocalStore {
    root: Utf8PathBuf,
    dir: Dir,
}

impl LocalStore {
    /// Creates `root` when missing and opens it.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Root`] when the directory cannot be created
    /// or opened.
    pub fn open(root: &Utf8Path) -> Result<Self, LocalStoreError> {
        let root_error = |err: std::io::Error| LocalStoreError::Root {
            path: root.to_path_buf(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(root, ambient_authority()).map_err(root_error)?;
        let dir = Dir::open_ambient_dir(root, ambient_authority()).map_err(root_error)?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    /// Path of the backup root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Creates the run directory `name` below the root and opens it.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Io`] when the directory cannot be created.
    pub fn create_run_dir(&self, name: &str) -> Result<RunDirectory, LocalStoreError> {
        self.dir
            .create_dir_all(name)
            .map_err(|err| self.io_error(name, &err))?;
        let dir = self
            .dir
            .open_dir(name)
            .map_err(|err| self.io_error(name, &err))?;
        Ok(RunDirectory {
            path: self.root.join(name),
            dir,
        })
    }

    /// Writes an empty file called `name` and returns its full path.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Io`] when the file cannot be written.
    pub fn write_empty_file(&self, name: &str) -> Result<Utf8PathBuf, LocalStoreError> {
        self.dir
            .write(name, b"")
            .map_err(|err| self.io_error(name, &err))?;
        Ok(self.root.join(name))
    }

    /// Reports whether an entry called `name` exists below the root.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Io`] when existence cannot be determined.
    pub fn exists(&self, name: &str) -> Result<bool, LocalStoreError> {
        self.dir
            .try_exists(name)
            .map_err(|err| self.io_error(name, &err))
    }

    /// Removes the file `name` when present.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Io`] when the file exists but cannot be
    /// removed.
    pub fn remove_file_if_exists(&self, name: &str) -> Result<(), LocalStoreError> {
        if self.exists(name)? {
            self.dir
                .remove_file(name)
                .map_err(|err| self.io_error(name, &err))?;
        }
        Ok(())
    }

    /// Removes the directory `name` and everything below it when present.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Io`] when the directory exists but cannot be
    /// removed.
    pub fn remove_dir_if_exists(&self, name: &str) -> Result<(), LocalStoreError> {
        if self.exists(name)? {
            self.dir
                .remove_dir_all(name)
                .map_err(|err| self.io_error(name, &err))?;
        }
        Ok(())
    }

    fn io_error(&self, name: &str, err: &std::io::Error) -> LocalStoreError {
        LocalStoreError::Io {
            path: self.root.join(name),
            message: err.to_string(),
        }
    }
}

/// Directory receiving the artifacts of one run.
#[derive(Debug)]
pub struct RunDirectory {
    path: Utf8PathBuf,
    dir: Dir,
}

impl RunDirectory {
    /// Full path of the run directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Creates (or truncates) the artifact file `name` for async writing.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Io`] when the file cannot be created, which
    /// includes names that would escape the run directory.
    pub fn create_file(&self, name: &str) -> Result<tokio::fs::File, LocalStoreError> {
        let file = self.dir.create(name).map_err(|err| LocalStoreError::Io {
            path: self.path.join(name),
            message: err.to_string(),
        })?;
        Ok(tokio::fs::File::from_std(file.into_std()))
    }
}

/// Local store in a fresh temporary directory, removed with everything in
/// it when dropped.
#[derive(Debug)]
pub struct ScratchStore {
    store: LocalStore,
    _temp: TempDir,
}

impl ScratchStore {
    /// Creates an empty scratch directory below the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns [`LocalStoreError::Root`] when the directory cannot be created
    /// or its path is not valid UTF-8.
    pub fn create() -> Result<Self, LocalStoreError> {
        let temp = tempfile::Builder::new()
            .prefix("vmbackup-")
            .tempdir()
            .map_err(|err| LocalStoreError::Root {
                path: lossy_path(&std::env::temp_dir()),
                message: err.to_string(),
            })?;
        let root = Utf8Path::from_path(temp.path()).ok_or_else(|| LocalStoreError::Root {
            path: lossy_path(temp.path()),
            message: String::from("temporary directory path is not valid UTF-8"),
        })?;
        let store = LocalStore::open(root)?;
        Ok(Self { store, _temp: temp })
    }

    /// The store rooted at the scratch directory.
    #[must_use]
    pub const fn store(&self) -> &LocalStore {
        &self.store
    }
}

fn lossy_path(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(temp.path().join("backups")).expect("utf8 path");
        (temp, root)
    }

    #[test]
    fn open_creates_missing_root() {
        let (_temp, root) = temp_root();
        let store = LocalStore::open(&root).expect("store should open");
        assert!(root.is_dir());
        assert_eq!(store.root(), root);
    }

    #[tokio::test]
    async fn run_directory_creates_artifact_files() {
        use tokio::io::AsyncWriteExt;

        let (_temp, root) = temp_root();
        let store = LocalStore::open(&root).expect("store should open");
        let run_dir = store.create_run_dir("web01_run").expect("run dir");

        let mut file = run_dir.create_file("disk.vmdk").expect("artifact file");
        file.write_all(b"abcd").await.expect("write");
        file.flush().await.expect("flush");

        let written = std::fs::metadata(root.join("web01_run").join("disk.vmdk"))
            .expect("artifact metadata");
        assert_eq!(written.len(), 4);
        assert_eq!(run_dir.path(), root.join("web01_run"));
    }

    #[test]
    fn artifact_names_cannot_escape_the_run_directory() {
        let (_temp, root) = temp_root();
        let store = LocalStore::open(&root).expect("store should open");
        let run_dir = store.create_run_dir("run").expect("run dir");

        assert!(run_dir.create_file("../escape.vmdk").is_err());
        assert_eq!(store.exists("escape.vmdk"), Ok(false));
    }

    #[test]
    fn removal_is_idempotent() {
        let (_temp, root) = temp_root();
        let store = LocalStore::open(&root).expect("store should open");
        store.write_empty_file("probe.tmp").expect("probe");
        store.create_run_dir("run").expect("run dir");

        store.remove_file_if_exists("probe.tmp").expect("remove file");
        store.remove_file_if_exists("probe.tmp").expect("remove again");
        store.remove_dir_if_exists("run").expect("remove dir");

        assert_eq!(store.exists("probe.tmp"), Ok(false));
        assert_eq!(store.exists("run"), Ok(false));
    }

    #[test]
    fn scratch_store_is_removed_on_drop() {
        let scratch = ScratchStore::create().expect("scratch store");
        let root = scratch.store().root().to_path_buf();
        scratch.store().write_empty_file("probe.tmp").expect("probe");
        assert!(root.is_dir());

        drop(scratch);

        assert!(!root.exists());
    }
}
