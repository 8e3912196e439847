//! Remote storage abstraction for uploading finished backups.
//!
//! Paths are slash-separated and relative to the storage endpoint; a leading
//! slash is optional and `/` addresses the endpoint itself.

use std::future::Future;
use std::pin::Pin;

use camino::Utf8Path;
use thiserror::Error;

mod webdav;

pub use webdav::WebDavStorage;

/// HTTP status returned when credentials are rejected.
pub const STATUS_UNAUTHORIZED: u16 = 401;

/// Errors raised by remote storage operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    /// Raised when the service cannot be reached at all.
    #[error("remote storage unreachable: {message}")]
    NotConnected {
        /// Transport error reported by the HTTP client.
        message: String,
    },
    /// Raised when the service answers with an unexpected status.
    #[error("remote storage returned HTTP {code} for {path}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Remote path of the failed request.
        path: String,
    },
    /// Raised when a local file involved in a transfer cannot be read.
    #[error("failed to read local file {path}: {message}")]
    LocalFile {
        /// Local path that failed.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the client cannot be configured or a response is invalid.
    #[error("remote storage protocol error: {message}")]
    Protocol {
        /// Human-readable error message.
        message: String,
    },
}

/// Metadata about a remote entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteEntry {
    /// Path that was queried.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Size in bytes for files that report one.
    pub size_bytes: Option<u64>,
}

/// Future returned by remote storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Interface implemented by remote storage services.
pub trait RemoteStorage {
    /// Queries metadata for `path`. Used as a connectivity and credential
    /// check when called with `/`.
    fn info<'a>(&'a self, path: &'a str) -> StorageFuture<'a, RemoteEntry>;

    /// Reports whether `path` exists.
    fn exists<'a>(&'a self, path: &'a str) -> StorageFuture<'a, bool>;

    /// Creates `path` and any missing parents.
    fn mkdir<'a>(&'a self, path: &'a str) -> StorageFuture<'a, ()>;

    /// Streams the local file `local` to `remote`, replacing any existing
    /// file.
    fn upload<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> StorageFuture<'a, ()>;

    /// Deletes the file at `remote`.
    fn delete<'a>(&'a self, remote: &'a str) -> StorageFuture<'a, ()>;
}

/// Joins a remote directory and an entry name with exactly one separator.
#[must_use]
pub fn remote_join(dir: &str, name: &str) -> String {
    let parent = dir.trim_end_matches('/');
    let child = name.trim_start_matches('/');
    if parent.is_empty() {
        child.to_owned()
    } else {
        format!("{parent}/{child}")
    }
}

/// Splits a remote path into its non-empty components.
pub fn remote_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}
