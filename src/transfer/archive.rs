//! Compressed archives of run directories.

use std::fs::File;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::info;

/// Errors raised while archiving a run directory.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ArchiveError {
    /// Raised when reading the source or writing the archive fails.
    #[error("failed to archive {source_dir} into {archive}: {message}")]
    Io {
        /// Directory being archived.
        source_dir: Utf8PathBuf,
        /// Archive being written.
        archive: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the blocking archive task cannot complete.
    #[error("archive task failed: {0}")]
    Task(String),
}

/// Writes `source_dir` as a gzip-compressed tarball at `archive`.
///
/// Entries are stored below `prefix` so the archive unpacks into a single
/// directory. A partially written archive is removed on failure.
///
/// # Errors
///
/// Returns [`ArchiveError::Io`] when any file cannot be read or written.
pub fn create_archive(
    source_dir: &Utf8Path,
    archive: &Utf8Path,
    prefix: &str,
) -> Result<(), ArchiveError> {
    let result = write_archive(source_dir, archive, prefix);
    if result.is_err() && archive.exists() {
        std::fs::remove_file(archive).ok();
    }
    result.map_err(|err| ArchiveError::Io {
        source_dir: source_dir.to_path_buf(),
        archive: archive.to_path_buf(),
        message: err.to_string(),
    })?;
    info!(archive = %archive, "archive created");
    Ok(())
}

fn write_archive(source_dir: &Utf8Path, archive: &Utf8Path, prefix: &str) -> std::io::Result<()> {
    let file = File::create(archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(prefix, source_dir)?;
    builder.into_inner()?.finish()?.sync_all()
}

/// Runs [`create_archive`] on the blocking thread pool.
///
/// # Errors
///
/// Returns the archive error, or [`ArchiveError::Task`] when the blocking
/// task panics or is cancelled.
pub async fn create_archive_blocking(
    source_dir: Utf8PathBuf,
    archive: Utf8PathBuf,
    prefix: String,
) -> Result<(), ArchiveError> {
    tokio::task::spawn_blocking(move || create_archive(&source_dir, &archive, &prefix))
        .await
        .map_err(|err| ArchiveError::Task(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn utf8(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path")
    }

    #[tokio::test]
    async fn archive_contains_every_artifact_under_prefix() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8(&temp);
        let run_dir = root.join("web01_2024-01-15_14-30-00");
        std::fs::create_dir_all(&run_dir).expect("run dir");
        std::fs::write(run_dir.join("disk-0.vmdk"), vec![7_u8; 4096]).expect("disk");
        std::fs::write(run_dir.join("disk-1.vmdk"), b"second").expect("disk");
        let archive = root.join("web01_2024-01-15_14-30-00.tar.gz");

        create_archive_blocking(
            run_dir.clone(),
            archive.clone(),
            String::from("web01_2024-01-15_14-30-00"),
        )
        .await
        .expect("archive should be created");

        let file = File::open(&archive).expect("open archive");
        let mut reader = tar::Archive::new(GzDecoder::new(file));
        let mut names: Vec<String> = reader
            .entries()
            .expect("entries")
            .filter_map(Result::ok)
            .filter(|entry| entry.header().entry_type().is_file())
            .filter_map(|entry| entry.path().ok().map(|path| path.display().to_string()))
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![
                String::from("web01_2024-01-15_14-30-00/disk-0.vmdk"),
                String::from("web01_2024-01-15_14-30-00/disk-1.vmdk"),
            ]
        );
    }

    #[test]
    fn missing_source_leaves_no_partial_archive() {
        let temp = TempDir::new().expect("temp dir");
        let root = utf8(&temp);
        let archive = root.join("missing.tar.gz");

        let err = create_archive(&root.join("missing"), &archive, "missing")
            .expect_err("missing source should fail");

        assert!(matches!(err, ArchiveError::Io { .. }), "got {err:?}");
        assert!(!archive.exists());
    }
}
