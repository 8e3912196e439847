//! Export lease protocol: locate the VM, obtain a lease, wait for it to
//! become ready, and enumerate downloadable artifacts.

use std::time::{Duration, Instant};

use reqwest::Url;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::hypervisor::{Hypervisor, LeaseHandle, LeaseState, VmHandle};
use crate::settings::{DEFAULT_LEASE_POLL_INTERVAL_MS, DEFAULT_LEASE_TIMEOUT_SECS};

/// Placeholder host that hypervisors put in device URLs.
const WILDCARD_HOST: &str = "*/";

/// Errors raised while driving the export lease protocol.
#[derive(Debug, Error)]
pub enum ExportError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when no VM in the inventory has the requested name.
    #[error("virtual machine '{name}' not found")]
    VmNotFound {
        /// Name that was searched for.
        name: String,
    },
    /// Raised when the lease enters an error state or an unexpected state.
    #[error("export lease failed: {message}")]
    LeaseFailed {
        /// Hypervisor-provided error message, or a description of the state.
        message: String,
    },
    /// Raised when the lease does not become ready in time.
    #[error("export lease not ready after {waited_secs}s")]
    LeaseTimeout {
        /// Seconds waited before giving up.
        waited_secs: u64,
    },
    /// Raised when a device URL cannot be turned into an artifact.
    #[error("invalid device URL {url}")]
    InvalidDeviceUrl {
        /// URL after host substitution.
        url: String,
    },
    /// Raised when a hypervisor call fails.
    #[error("hypervisor call '{action}' failed: {source}")]
    Hypervisor {
        /// Operation that failed.
        action: &'static str,
        /// Error reported by the hypervisor session.
        #[source]
        source: E,
    },
}

/// One downloadable file belonging to an export.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactDescriptor {
    /// File name used for the local copy.
    pub name: String,
    /// Absolute download URL with the host placeholder substituted.
    pub source_url: String,
    /// Declared size in bytes, or zero when the server does not declare one.
    pub size_bytes: u64,
}

/// Drives a hypervisor through the export lease protocol.
pub struct ExportController<'a, H: Hypervisor> {
    hypervisor: &'a H,
    host: &'a str,
    poll_interval: Duration,
    timeout: Duration,
}

impl<'a, H: Hypervisor> ExportController<'a, H> {
    /// Creates a controller that substitutes `host` into device URLs.
    #[must_use]
    pub const fn new(hypervisor: &'a H, host: &'a str) -> Self {
        Self {
            hypervisor,
            host,
            poll_interval: Duration::from_millis(DEFAULT_LEASE_POLL_INTERVAL_MS),
            timeout: Duration::from_secs(DEFAULT_LEASE_TIMEOUT_SECS),
        }
    }

    /// Overrides the interval between lease polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides the maximum wait for lease readiness.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the first VM whose name equals `name` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::VmNotFound`] when nothing matches.
    pub async fn find_vm(&self, name: &str) -> Result<VmHandle, ExportError<H::Error>> {
        let vms = self
            .hypervisor
            .list_vms()
            .await
            .map_err(hypervisor_error("list_vms"))?;
        debug!(count = vms.len(), "listed virtual machines");
        vms.into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| ExportError::VmNotFound {
                name: name.to_owned(),
            })
    }

    /// Requests an export lease for `vm`.
    ///
    /// The caller owns the returned lease and must complete it exactly once,
    /// whatever happens afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Hypervisor`] when the request fails.
    pub async fn request_lease(&self, vm: &VmHandle) -> Result<LeaseHandle, ExportError<H::Error>> {
        let lease = self
            .hypervisor
            .export_vm(vm)
            .await
            .map_err(hypervisor_error("export_vm"))?;
        info!(vm = %vm.name, lease = %lease.id, "export lease requested");
        Ok(lease)
    }

    /// Polls `lease` until it leaves the initializing state and returns its
    /// device URLs.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::LeaseFailed`] when the lease reports an error
    /// or any state other than ready, and [`ExportError::LeaseTimeout`] when
    /// it stays initializing past the configured timeout. A timeout too large
    /// to represent as an instant never expires.
    pub async fn wait_until_ready(
        &self,
        lease: &LeaseHandle,
    ) -> Result<Vec<String>, ExportError<H::Error>> {
        let started = Instant::now();
        let deadline = started.checked_add(self.timeout);
        while deadline.is_none_or(|limit| Instant::now() <= limit) {
            let status = self
                .hypervisor
                .lease_status(lease)
                .await
                .map_err(hypervisor_error("lease_status"))?;
            match status.state {
                LeaseState::Initializing => {
                    debug!(lease = %lease.id, "lease initializing");
                    sleep(self.poll_interval).await;
                }
                LeaseState::Ready => {
                    info!(lease = %lease.id, devices = status.device_urls.len(), "lease ready");
                    return Ok(status.device_urls);
                }
                LeaseState::Error(message) => {
                    return Err(ExportError::LeaseFailed {
                        message: message.unwrap_or_else(|| String::from("unknown lease error")),
                    });
                }
                LeaseState::Done => {
                    return Err(ExportError::LeaseFailed {
                        message: String::from("lease finished before it became ready"),
                    });
                }
            }
        }

        Err(ExportError::LeaseTimeout {
            waited_secs: started.elapsed().as_secs(),
        })
    }

    /// Turns device URLs into artifact descriptors in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::InvalidDeviceUrl`] when a URL has no file name.
    /// A size query that fails leaves the size unknown (zero), which skips
    /// size verification for that artifact.
    pub async fn enumerate_artifacts(
        &self,
        device_urls: &[String],
    ) -> Result<Vec<ArtifactDescriptor>, ExportError<H::Error>> {
        let mut artifacts = Vec::with_capacity(device_urls.len());
        for device_url in device_urls {
            let source_url = substitute_host(device_url, self.host);
            let name = artifact_name(&source_url).ok_or_else(|| ExportError::InvalidDeviceUrl {
                url: source_url.clone(),
            })?;
            let size_bytes = match self.hypervisor.artifact_size(&source_url).await {
                Ok(size) => size,
                Err(err) => {
                    warn!(artifact = %name, error = %err, "artifact size unknown");
                    0
                }
            };
            debug!(artifact = %name, size_bytes, "artifact discovered");
            artifacts.push(ArtifactDescriptor {
                name,
                source_url,
                size_bytes,
            });
        }
        Ok(artifacts)
    }
}

fn hypervisor_error<E>(action: &'static str) -> impl FnOnce(E) -> ExportError<E>
where
    E: std::error::Error + 'static,
{
    move |source| ExportError::Hypervisor { action, source }
}

/// Replaces the first host placeholder in `url` with `host`.
#[must_use]
pub fn substitute_host(url: &str, host: &str) -> String {
    url.replacen(WILDCARD_HOST, &format!("{host}/"), 1)
}

/// Returns the last path segment of `url`, ignoring any query string.
#[must_use]
pub fn artifact_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://host/path/to/disk-flat.vmdk?params", Some("disk-flat.vmdk"))]
    #[case("https://esxi.lab/nfc/52a1/disk-0.vmdk", Some("disk-0.vmdk"))]
    #[case("https://esxi.lab/nfc/52a1/", None)]
    #[case("not a url", None)]
    fn artifact_name_is_last_path_segment(#[case] url: &str, #[case] expected: Option<&str>) {
        assert_eq!(artifact_name(url).as_deref(), expected);
    }

    #[test]
    fn host_placeholder_is_substituted_once() {
        assert_eq!(
            substitute_host("https://*/nfc/52a1/disk-0.vmdk", "esxi.lab"),
            "https://esxi.lab/nfc/52a1/disk-0.vmdk"
        );
        assert_eq!(
            substitute_host("https://10.0.0.5/nfc/disk.vmdk", "esxi.lab"),
            "https://10.0.0.5/nfc/disk.vmdk"
        );
    }
}
