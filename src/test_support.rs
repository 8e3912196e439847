//! Test support utilities shared across unit and integration tests.
//!
//! The doubles keep their state behind `Arc<Mutex<_>>` so a test can hand a
//! clone to the orchestrator and still inspect call counts afterwards.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use camino::Utf8Path;
use futures::StreamExt;
use futures::stream;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::export::artifact_name;
use crate::hypervisor::{
    ArtifactStream, Hypervisor, HypervisorFuture, LeaseHandle, LeaseState, LeaseStatus, VmHandle,
};
use crate::storage::{RemoteEntry, RemoteStorage, StorageError, StorageFuture, remote_components};
use crate::transfer::{ArtifactProgress, ProgressObserver};

/// Lease identifier handed out by [`ScriptedHypervisor`].
pub const SCRIPTED_LEASE_ID: &str = "52a1f3c0-lease";

const SCRIPTED_CHUNK_BYTES: usize = 64 * 1024;

/// Failure reported by [`ScriptedHypervisor`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedHypervisorError {
    /// A failure the test asked for.
    #[error("scripted failure: {0}")]
    Scripted(String),
    /// A download was requested for an artifact that was never scripted.
    #[error("unknown artifact {0}")]
    UnknownArtifact(String),
}

/// Number of calls made to each [`ScriptedHypervisor`] operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HypervisorCalls {
    /// `connect` calls.
    pub connect: usize,
    /// `list_vms` calls.
    pub list_vms: usize,
    /// `export_vm` calls.
    pub export_vm: usize,
    /// `lease_status` calls.
    pub lease_status: usize,
    /// `lease_progress` calls.
    pub lease_progress: usize,
    /// `complete_lease` calls.
    pub complete_lease: usize,
    /// `open_artifact` calls.
    pub open_artifact: usize,
    /// `disconnect` calls.
    pub disconnect: usize,
}

#[derive(Clone, Debug)]
struct ScriptedArtifact {
    name: String,
    declared_bytes: u64,
    served_bytes: u64,
    interrupted: bool,
}

#[derive(Debug, Default)]
struct HypervisorState {
    vms: Vec<VmHandle>,
    lease_states: VecDeque<LeaseState>,
    artifacts: Vec<ScriptedArtifact>,
    fail_connect: bool,
    fail_size: bool,
    fail_complete: bool,
    fail_disconnect: bool,
    calls: HypervisorCalls,
}

impl HypervisorState {
    fn next_lease_state(&mut self) -> LeaseState {
        if self.lease_states.len() > 1 {
            self.lease_states.pop_front().unwrap_or(LeaseState::Ready)
        } else {
            self.lease_states
                .front()
                .cloned()
                .unwrap_or(LeaseState::Ready)
        }
    }

    fn artifact(&self, url: &str) -> Result<ScriptedArtifact, ScriptedHypervisorError> {
        let name = artifact_name(url).unwrap_or_default();
        self.artifacts
            .iter()
            .find(|artifact| artifact.name == name)
            .cloned()
            .ok_or_else(|| ScriptedHypervisorError::UnknownArtifact(url.to_owned()))
    }
}

/// Hypervisor double driven by a script of VMs, lease states, and artifacts.
///
/// Lease states are consumed in order; the last one repeats. Without any
/// scripted state the lease is immediately ready.
#[derive(Clone, Debug, Default)]
pub struct ScriptedHypervisor {
    state: Arc<Mutex<HypervisorState>>,
}

impl ScriptedHypervisor {
    /// Creates a hypervisor with an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HypervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a VM to the inventory.
    #[must_use]
    pub fn with_vm(self, name: &str, id: &str) -> Self {
        self.lock().vms.push(VmHandle {
            name: name.to_owned(),
            id: id.to_owned(),
        });
        self
    }

    /// Scripts the states returned by successive lease polls.
    #[must_use]
    pub fn with_lease_states(self, states: impl IntoIterator<Item = LeaseState>) -> Self {
        self.lock().lease_states = states.into_iter().collect();
        self
    }

    /// Adds an artifact that serves exactly its declared size.
    #[must_use]
    pub fn with_artifact(self, name: &str, bytes: u64) -> Self {
        self.push_artifact(name, bytes, bytes, false)
    }

    /// Adds an artifact that serves fewer bytes than it declares.
    #[must_use]
    pub fn with_truncated_artifact(self, name: &str, declared: u64, served: u64) -> Self {
        self.push_artifact(name, declared, served, false)
    }

    /// Adds an artifact whose download fails after serving `served` bytes.
    #[must_use]
    pub fn with_interrupted_artifact(self, name: &str, declared: u64, served: u64) -> Self {
        self.push_artifact(name, declared, served, true)
    }

    fn push_artifact(self, name: &str, declared: u64, served: u64, interrupted: bool) -> Self {
        self.lock().artifacts.push(ScriptedArtifact {
            name: name.to_owned(),
            declared_bytes: declared,
            served_bytes: served,
            interrupted,
        });
        self
    }

    /// Makes `connect` fail.
    #[must_use]
    pub fn failing_connect(self) -> Self {
        self.lock().fail_connect = true;
        self
    }

    /// Makes every `artifact_size` query fail.
    #[must_use]
    pub fn failing_size_queries(self) -> Self {
        self.lock().fail_size = true;
        self
    }

    /// Makes `complete_lease` fail.
    #[must_use]
    pub fn failing_completion(self) -> Self {
        self.lock().fail_complete = true;
        self
    }

    /// Makes `disconnect` fail.
    #[must_use]
    pub fn failing_disconnect(self) -> Self {
        self.lock().fail_disconnect = true;
        self
    }

    /// Returns a snapshot of the call counters.
    #[must_use]
    pub fn calls(&self) -> HypervisorCalls {
        self.lock().calls.clone()
    }

    /// Device URL advertised for the artifact `name`.
    #[must_use]
    pub fn device_url(name: &str) -> String {
        format!("https://*/nfc/{SCRIPTED_LEASE_ID}/{name}")
    }
}

fn scripted_result(fail: bool, action: &str) -> Result<(), ScriptedHypervisorError> {
    if fail {
        Err(ScriptedHypervisorError::Scripted(format!("{action} refused")))
    } else {
        Ok(())
    }
}

fn chunk_sizes(total: u64) -> impl Iterator<Item = usize> + Send + 'static {
    let chunk = SCRIPTED_CHUNK_BYTES as u64;
    (0..total.div_ceil(chunk)).map(move |index| {
        let remaining = total.saturating_sub(index * chunk).min(chunk);
        usize::try_from(remaining).unwrap_or(SCRIPTED_CHUNK_BYTES)
    })
}

impl Hypervisor for ScriptedHypervisor {
    type Error = ScriptedHypervisorError;

    fn connect(&mut self) -> HypervisorFuture<'_, (), Self::Error> {
        let mut state = self.lock();
        state.calls.connect += 1;
        let result = scripted_result(state.fail_connect, "connect");
        Box::pin(ready(result))
    }

    fn list_vms(&self) -> HypervisorFuture<'_, Vec<VmHandle>, Self::Error> {
        let mut state = self.lock();
        state.calls.list_vms += 1;
        Box::pin(ready(Ok(state.vms.clone())))
    }

    fn export_vm<'a>(
        &'a self,
        _vm: &'a VmHandle,
    ) -> HypervisorFuture<'a, LeaseHandle, Self::Error> {
        self.lock().calls.export_vm += 1;
        Box::pin(ready(Ok(LeaseHandle {
            id: SCRIPTED_LEASE_ID.to_owned(),
        })))
    }

    fn lease_status<'a>(
        &'a self,
        _lease: &'a LeaseHandle,
    ) -> HypervisorFuture<'a, LeaseStatus, Self::Error> {
        let mut state = self.lock();
        state.calls.lease_status += 1;
        let lease_state = state.next_lease_state();
        let device_urls = if lease_state == LeaseState::Ready {
            state
                .artifacts
                .iter()
                .map(|artifact| Self::device_url(&artifact.name))
                .collect()
        } else {
            Vec::new()
        };
        Box::pin(ready(Ok(LeaseStatus {
            state: lease_state,
            device_urls,
        })))
    }

    fn lease_progress<'a>(
        &'a self,
        _lease: &'a LeaseHandle,
        _percent: u8,
    ) -> HypervisorFuture<'a, (), Self::Error> {
        self.lock().calls.lease_progress += 1;
        Box::pin(ready(Ok(())))
    }

    fn complete_lease(&self, _lease: LeaseHandle) -> HypervisorFuture<'_, (), Self::Error> {
        let mut state = self.lock();
        state.calls.complete_lease += 1;
        let result = scripted_result(state.fail_complete, "lease completion");
        Box::pin(ready(result))
    }

    fn artifact_size<'a>(&'a self, url: &'a str) -> HypervisorFuture<'a, u64, Self::Error> {
        let state = self.lock();
        let result = scripted_result(state.fail_size, "size query")
            .and_then(|()| state.artifact(url))
            .map(|artifact| artifact.declared_bytes);
        Box::pin(ready(result))
    }

    fn open_artifact<'a>(
        &'a self,
        url: &'a str,
    ) -> HypervisorFuture<'a, ArtifactStream<Self::Error>, Self::Error> {
        let mut state = self.lock();
        state.calls.open_artifact += 1;
        let result = state.artifact(url).map(|artifact| {
            let failure = artifact.interrupted.then(|| {
                Err(ScriptedHypervisorError::Scripted(format!(
                    "connection reset while reading {}",
                    artifact.name
                )))
            });
            let chunks = chunk_sizes(artifact.served_bytes)
                .map(|len| Ok::<Bytes, ScriptedHypervisorError>(Bytes::from(vec![0_u8; len])));
            stream::iter(chunks).chain(stream::iter(failure)).boxed()
        });
        Box::pin(ready(result))
    }

    fn disconnect(&mut self) -> HypervisorFuture<'_, (), Self::Error> {
        let mut state = self.lock();
        state.calls.disconnect += 1;
        let result = scripted_result(state.fail_disconnect, "logout");
        Box::pin(ready(result))
    }
}

/// Number of calls made to each [`MemoryStorage`] operation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StorageCalls {
    /// `info` calls.
    pub info: usize,
    /// `exists` calls.
    pub exists: usize,
    /// `mkdir` calls.
    pub mkdir: usize,
    /// `upload` calls.
    pub upload: usize,
    /// `delete` calls.
    pub delete: usize,
}

impl StorageCalls {
    /// Total number of calls across every operation.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.info + self.exists + self.mkdir + self.upload + self.delete
    }
}

#[derive(Debug, Default)]
struct StorageState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, u64>,
    uploads: Vec<String>,
    info_error: Option<StorageError>,
    refuse_mkdir: bool,
    fail_upload_suffix: Option<String>,
    calls: StorageCalls,
}

impl StorageState {
    fn exists(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path) || self.files.contains_key(path)
    }
}

fn normalise(path: &str) -> String {
    remote_components(path).collect::<Vec<_>>().join("/")
}

/// In-memory remote storage with switchable failures.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    /// Creates empty storage that accepts every operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StorageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-creates `path` as a directory.
    #[must_use]
    pub fn with_dir(self, path: &str) -> Self {
        self.lock().dirs.insert(normalise(path));
        self
    }

    /// Makes `info` fail as if the service were unreachable.
    #[must_use]
    pub fn unreachable(self) -> Self {
        self.lock().info_error = Some(StorageError::NotConnected {
            message: String::from("connection refused"),
        });
        self
    }

    /// Makes `info` fail with HTTP 401.
    #[must_use]
    pub fn rejecting_credentials(self) -> Self {
        self.lock().info_error = Some(StorageError::Status {
            code: 401,
            path: String::from("/"),
        });
        self
    }

    /// Makes `mkdir` succeed without creating anything.
    #[must_use]
    pub fn refusing_mkdir(self) -> Self {
        self.lock().refuse_mkdir = true;
        self
    }

    /// Makes uploads whose remote path ends with `suffix` fail with HTTP 507.
    #[must_use]
    pub fn failing_uploads_ending_with(self, suffix: &str) -> Self {
        self.lock().fail_upload_suffix = Some(suffix.to_owned());
        self
    }

    /// Returns a snapshot of the call counters.
    #[must_use]
    pub fn calls(&self) -> StorageCalls {
        self.lock().calls.clone()
    }

    /// Remote paths of every upload attempt, in order.
    #[must_use]
    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    /// Remote files currently stored, with their sizes.
    #[must_use]
    pub fn files(&self) -> BTreeMap<String, u64> {
        self.lock().files.clone()
    }

    /// Whether `path` exists as a directory.
    #[must_use]
    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(&normalise(path))
    }

    fn record_upload(&self, local: &Utf8Path, remote: &str) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.calls.upload += 1;
        state.uploads.push(remote.to_owned());
        if state
            .fail_upload_suffix
            .as_deref()
            .is_some_and(|suffix| remote.ends_with(suffix))
        {
            return Err(StorageError::Status {
                code: 507,
                path: remote.to_owned(),
            });
        }
        let size = std::fs::metadata(local)
            .map_err(|err| StorageError::LocalFile {
                path: local.to_string(),
                message: err.to_string(),
            })?
            .len();
        state.files.insert(normalise(remote), size);
        Ok(())
    }
}

impl RemoteStorage for MemoryStorage {
    fn info<'a>(&'a self, path: &'a str) -> StorageFuture<'a, RemoteEntry> {
        let mut state = self.lock();
        state.calls.info += 1;
        let key = normalise(path);
        let result = if let Some(err) = state.info_error.clone() {
            Err(err)
        } else if key.is_empty() || state.dirs.contains(&key) {
            Ok(RemoteEntry {
                path: path.to_owned(),
                is_dir: true,
                size_bytes: None,
            })
        } else if let Some(size) = state.files.get(&key) {
            Ok(RemoteEntry {
                path: path.to_owned(),
                is_dir: false,
                size_bytes: Some(*size),
            })
        } else {
            Err(StorageError::Status {
                code: 404,
                path: path.to_owned(),
            })
        };
        Box::pin(ready(result))
    }

    fn exists<'a>(&'a self, path: &'a str) -> StorageFuture<'a, bool> {
        let mut state = self.lock();
        state.calls.exists += 1;
        let found = state.exists(&normalise(path));
        Box::pin(ready(Ok(found)))
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> StorageFuture<'a, ()> {
        let mut state = self.lock();
        state.calls.mkdir += 1;
        if !state.refuse_mkdir {
            let mut current = Vec::new();
            for component in remote_components(path) {
                current.push(component);
                state.dirs.insert(current.join("/"));
            }
        }
        Box::pin(ready(Ok(())))
    }

    fn upload<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(ready(self.record_upload(local, remote)))
    }

    fn delete<'a>(&'a self, remote: &'a str) -> StorageFuture<'a, ()> {
        let mut state = self.lock();
        state.calls.delete += 1;
        let result = match state.files.remove(&normalise(remote)) {
            Some(_) => Ok(()),
            None => Err(StorageError::Status {
                code: 404,
                path: remote.to_owned(),
            }),
        };
        Box::pin(ready(result))
    }
}

/// Progress events captured by [`RecordingProgress`] for one artifact.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProgressRecord {
    /// Artifact name.
    pub name: String,
    /// Declared size announced at start.
    pub total_bytes: u64,
    /// Sum of every advance.
    pub advanced_bytes: u64,
    /// Outcome once finished.
    pub succeeded: Option<bool>,
}

/// Progress observer that records every event.
#[derive(Clone, Debug, Default)]
pub struct RecordingProgress {
    records: Arc<Mutex<Vec<ProgressRecord>>>,
}

impl RecordingProgress {
    /// Creates an observer with no records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every record in start order.
    #[must_use]
    pub fn records(&self) -> Vec<ProgressRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressObserver for RecordingProgress {
    fn start(&self, name: &str, total_bytes: u64) -> Box<dyn ArtifactProgress> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(ProgressRecord {
            name: name.to_owned(),
            total_bytes,
            ..ProgressRecord::default()
        });
        Box::new(RecordingArtifact {
            records: Arc::clone(&self.records),
            index: records.len().saturating_sub(1),
        })
    }
}

struct RecordingArtifact {
    records: Arc<Mutex<Vec<ProgressRecord>>>,
    index: usize,
}

impl RecordingArtifact {
    fn update(&self, apply: impl FnOnce(&mut ProgressRecord)) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(self.index) {
            apply(record);
        }
    }
}

impl ArtifactProgress for RecordingArtifact {
    fn advance(&self, bytes: u64) {
        self.update(|record| record.advanced_bytes += bytes);
    }

    fn finish(self: Box<Self>, succeeded: bool) {
        self.update(|record| record.succeeded = Some(succeeded));
    }
}

/// Global mutex used to serialise environment mutation across tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Restores environment variables when dropped.
#[derive(Debug)]
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
