//! Error types for the vSphere session.

use thiserror::Error;

use crate::xml::XmlError;

/// Errors raised by [`super::VsphereSession`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VsphereError {
    /// Raised when the HTTP client cannot be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    /// Raised when the host cannot be reached or a transfer is interrupted.
    #[error("connection to hypervisor failed: {message}")]
    Transport {
        /// Transport error reported by the HTTP client.
        message: String,
    },
    /// Raised when the host rejects the configured credentials.
    #[error("hypervisor rejected the login: {message}")]
    Authentication {
        /// Fault message returned by the host.
        message: String,
    },
    /// Raised when the host answers a call with a SOAP fault.
    #[error("hypervisor call {method} failed: {message}")]
    Fault {
        /// SOAP method that faulted.
        method: &'static str,
        /// Fault message returned by the host.
        message: String,
    },
    /// Raised when a request returns an unexpected HTTP status.
    #[error("hypervisor returned HTTP {code} for {context}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Method name or URL of the failed request.
        context: String,
    },
    /// Raised when a response body cannot be parsed.
    #[error(transparent)]
    Xml(#[from] XmlError),
    /// Raised when a response lacks a required element.
    #[error("response to {method} is missing {element}")]
    MissingElement {
        /// SOAP method whose response was incomplete.
        method: &'static str,
        /// Element that was expected.
        element: &'static str,
    },
    /// Raised when an operation needs a session that was never established.
    #[error("hypervisor session is not connected")]
    NotConnected,
}

impl VsphereError {
    pub(super) fn transport(err: &reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}
