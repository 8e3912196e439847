//! Hypervisor session abstraction used by the export controller.
//!
//! The orchestrator never talks to a hypervisor API directly; it drives an
//! implementation of [`Hypervisor`] through authentication, inventory lookup,
//! the export-lease protocol, and artifact downloads. This keeps the lease
//! state machine testable with scripted doubles.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;

/// Opaque reference to a virtual machine in the hypervisor inventory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmHandle {
    /// Display name of the virtual machine.
    pub name: String,
    /// Provider specific managed object identifier.
    pub id: String,
}

/// Opaque reference to an export lease granted by the hypervisor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseHandle {
    /// Provider specific managed object identifier.
    pub id: String,
}

/// Observable states of an export lease.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LeaseState {
    /// The hypervisor is still preparing the export.
    Initializing,
    /// Device URLs are available for download.
    Ready,
    /// The lease has already been completed or aborted.
    Done,
    /// The hypervisor reported an error, with its message when available.
    Error(Option<String>),
}

impl LeaseState {
    /// Parses the textual state reported by the hypervisor.
    ///
    /// Unknown values are reported as an error state without a message so the
    /// controller fails closed.
    #[must_use]
    pub fn from_wire(state: &str, error: Option<String>) -> Self {
        match state {
            "initializing" => Self::Initializing,
            "ready" => Self::Ready,
            "done" => Self::Done,
            _ => Self::Error(error),
        }
    }
}

/// Snapshot of a lease as returned by a single poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseStatus {
    /// Current state of the lease.
    pub state: LeaseState,
    /// Device URLs declared by the lease, in hypervisor order. Empty until
    /// the lease is ready.
    pub device_urls: Vec<String>,
}

/// Future returned by hypervisor operations.
pub type HypervisorFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Byte stream returned when downloading an artifact.
pub type ArtifactStream<E> = BoxStream<'static, Result<Bytes, E>>;

/// Interface implemented by hypervisor sessions.
///
/// `connect` must be called before any other operation; implementations keep
/// the authenticated session (for example a cookie) internally and reuse it
/// for artifact downloads.
pub trait Hypervisor {
    /// Provider specific error type returned by the session.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Authenticates against the hypervisor.
    fn connect(&mut self) -> HypervisorFuture<'_, (), Self::Error>;

    /// Lists every virtual machine in the inventory.
    fn list_vms(&self) -> HypervisorFuture<'_, Vec<VmHandle>, Self::Error>;

    /// Requests an export lease for `vm`.
    fn export_vm<'a>(&'a self, vm: &'a VmHandle) -> HypervisorFuture<'a, LeaseHandle, Self::Error>;

    /// Reads the current state and device URLs of `lease`.
    fn lease_status<'a>(
        &'a self,
        lease: &'a LeaseHandle,
    ) -> HypervisorFuture<'a, LeaseStatus, Self::Error>;

    /// Reports overall export progress (0-100) to keep the lease alive.
    fn lease_progress<'a>(
        &'a self,
        lease: &'a LeaseHandle,
        percent: u8,
    ) -> HypervisorFuture<'a, (), Self::Error>;

    /// Signals that the export is finished and releases hypervisor resources.
    fn complete_lease(&self, lease: LeaseHandle) -> HypervisorFuture<'_, (), Self::Error>;

    /// Returns the declared size of the artifact at `url` without fetching
    /// its body.
    fn artifact_size<'a>(&'a self, url: &'a str) -> HypervisorFuture<'a, u64, Self::Error>;

    /// Opens a streaming read of the artifact at `url`.
    fn open_artifact<'a>(
        &'a self,
        url: &'a str,
    ) -> HypervisorFuture<'a, ArtifactStream<Self::Error>, Self::Error>;

    /// Ends the authenticated session.
    fn disconnect(&mut self) -> HypervisorFuture<'_, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("initializing", LeaseState::Initializing)]
    #[case("ready", LeaseState::Ready)]
    #[case("done", LeaseState::Done)]
    #[case("error", LeaseState::Error(None))]
    #[case("bogus", LeaseState::Error(None))]
    fn lease_state_parses_wire_values(#[case] wire: &str, #[case] expected: LeaseState) {
        assert_eq!(LeaseState::from_wire(wire, None), expected);
    }

    #[test]
    fn lease_state_keeps_reported_error_message() {
        let state = LeaseState::from_wire("error", Some(String::from("disk locked")));
        assert_eq!(state, LeaseState::Error(Some(String::from("disk locked"))));
    }
}
