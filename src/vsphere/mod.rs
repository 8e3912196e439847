//! vSphere web services session implementing [`Hypervisor`].
//!
//! Speaks SOAP over HTTPS to the host's `/sdk` endpoint. The session cookie
//! returned at login is replayed on every call and on artifact downloads,
//! which the host serves from the same origin.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderMap, SET_COOKIE};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, info, warn};

use crate::config::HypervisorConfig;
use crate::hypervisor::{
    ArtifactStream, Hypervisor, HypervisorFuture, LeaseHandle, LeaseStatus, VmHandle,
};
use crate::xml::Element;

mod error;
mod soap;

pub use error::VsphereError;
use soap::ServiceContent;

const SOAP_ACTION: &str = "urn:vim25/7.0";
const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";
const SESSION_COOKIE: &str = "vmware_soap_session";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
struct Session {
    content: ServiceContent,
}

/// Authenticated connection to an ESXi host.
#[derive(Debug)]
pub struct VsphereSession {
    client: Client,
    sdk_url: String,
    user: String,
    password: String,
    cookie: Option<String>,
    session: Option<Session>,
}

impl VsphereSession {
    /// Prepares a session for the host in `config` without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`VsphereError::Client`] when the HTTP client cannot be built.
    pub fn new(config: &HypervisorConfig) -> Result<Self, VsphereError> {
        if config.accept_invalid_certs {
            warn!(host = %config.host, "TLS certificate verification disabled for hypervisor");
        }
        let client = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| VsphereError::Client(err.to_string()))?;
        Ok(Self {
            client,
            sdk_url: format!("https://{}/sdk", authority(config)),
            user: config.user.clone(),
            password: config.password.clone(),
            cookie: None,
            session: None,
        })
    }

    fn content(&self) -> Result<&ServiceContent, VsphereError> {
        self.session
            .as_ref()
            .map(|session| &session.content)
            .ok_or(VsphereError::NotConnected)
    }

    fn with_cookie(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.cookie {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    async fn call(
        &self,
        method: &'static str,
        body: String,
    ) -> Result<(Element, Option<String>), VsphereError> {
        debug!(method, "vSphere call");
        let request = self
            .client
            .post(&self.sdk_url)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header("SOAPAction", SOAP_ACTION)
            .body(soap::envelope(body));
        let response = self
            .with_cookie(request)
            .send()
            .await
            .map_err(|err| VsphereError::transport(&err))?;
        let status = response.status();
        let cookie = session_cookie(response.headers());
        let text = response
            .text()
            .await
            .map_err(|err| VsphereError::transport(&err))?;

        let document = Element::parse(&text)?;
        if let Some(fault) = soap::fault(method, &document) {
            return Err(fault);
        }
        if !status.is_success() {
            return Err(VsphereError::Status {
                code: status.as_u16(),
                context: method.to_owned(),
            });
        }
        Ok((document, cookie))
    }

    async fn login(&mut self) -> Result<(), VsphereError> {
        let (document, first_cookie) = self
            .call("RetrieveServiceContent", soap::retrieve_service_content())
            .await?;
        let content = soap::parse_service_content(&document)?;
        if first_cookie.is_some() {
            self.cookie = first_cookie;
        }

        let (_, login_cookie) = self
            .call(
                "Login",
                soap::login(&content.session_manager, &self.user, &self.password),
            )
            .await?;
        if login_cookie.is_some() {
            self.cookie = login_cookie;
        }
        info!(sdk = %self.sdk_url, "logged in to hypervisor");
        self.session = Some(Session { content });
        Ok(())
    }

    async fn all_vms(&self) -> Result<Vec<VmHandle>, VsphereError> {
        let content = self.content()?;
        let (view_doc, _) = self
            .call(
                "CreateContainerView",
                soap::create_vm_view(&content.view_manager, &content.root_folder),
            )
            .await?;
        let view = soap::parse_reference("CreateContainerView", &view_doc)?;

        let listed = self.collect_vms(&content.property_collector, &view).await;
        if let Err(err) = self.call("DestroyView", soap::destroy_view(&view)).await {
            warn!(error = %err, "failed to destroy container view");
        }
        listed
    }

    async fn collect_vms(
        &self,
        property_collector: &str,
        view: &str,
    ) -> Result<Vec<VmHandle>, VsphereError> {
        let (first, _) = self
            .call(
                "RetrievePropertiesEx",
                soap::retrieve_vm_names(property_collector, view),
            )
            .await?;
        let mut page = soap::parse_vm_page(&first);
        let mut vms = std::mem::take(&mut page.vms);
        while let Some(token) = page.token.take() {
            let (next, _) = self
                .call(
                    "ContinueRetrievePropertiesEx",
                    soap::continue_retrieve(property_collector, &token),
                )
                .await?;
            page = soap::parse_vm_page(&next);
            vms.append(&mut page.vms);
        }
        Ok(vms)
    }

    async fn export(&self, vm: &VmHandle) -> Result<LeaseHandle, VsphereError> {
        self.content()?;
        let (document, _) = self.call("ExportVm", soap::export_vm(&vm.id)).await?;
        Ok(LeaseHandle {
            id: soap::parse_reference("ExportVm", &document)?,
        })
    }

    async fn status(&self, lease: &LeaseHandle) -> Result<LeaseStatus, VsphereError> {
        let content = self.content()?;
        let (document, _) = self
            .call(
                "RetrievePropertiesEx",
                soap::retrieve_lease(&content.property_collector, &lease.id),
            )
            .await?;
        soap::parse_lease_status(&document)
    }

    async fn progress(&self, lease: &LeaseHandle, percent: u8) -> Result<(), VsphereError> {
        self.content()?;
        self.call(
            "HttpNfcLeaseProgress",
            soap::lease_progress(&lease.id, percent),
        )
        .await?;
        Ok(())
    }

    async fn complete(&self, lease: &LeaseHandle) -> Result<(), VsphereError> {
        self.content()?;
        self.call("HttpNfcLeaseComplete", soap::lease_complete(&lease.id))
            .await?;
        info!(lease = %lease.id, "export lease completed");
        Ok(())
    }

    async fn head(&self, url: &str) -> Result<u64, VsphereError> {
        let response = self
            .with_cookie(self.client.head(url))
            .send()
            .await
            .map_err(|err| VsphereError::transport(&err))?;
        if !response.status().is_success() {
            return Err(VsphereError::Status {
                code: response.status().as_u16(),
                context: url.to_owned(),
            });
        }
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    async fn download(&self, url: &str) -> Result<ArtifactStream<VsphereError>, VsphereError> {
        let response = self
            .with_cookie(self.client.get(url))
            .send()
            .await
            .map_err(|err| VsphereError::transport(&err))?;
        if !response.status().is_success() {
            return Err(VsphereError::Status {
                code: response.status().as_u16(),
                context: url.to_owned(),
            });
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| VsphereError::transport(&err)))
            .boxed())
    }

    async fn logout(&mut self) -> Result<(), VsphereError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let result = self
            .call("Logout", soap::logout(&session.content.session_manager))
            .await;
        self.cookie = None;
        result?;
        info!("logged out of hypervisor");
        Ok(())
    }
}

impl Hypervisor for VsphereSession {
    type Error = VsphereError;

    fn connect(&mut self) -> HypervisorFuture<'_, (), Self::Error> {
        Box::pin(self.login())
    }

    fn list_vms(&self) -> HypervisorFuture<'_, Vec<VmHandle>, Self::Error> {
        Box::pin(self.all_vms())
    }

    fn export_vm<'a>(&'a self, vm: &'a VmHandle) -> HypervisorFuture<'a, LeaseHandle, Self::Error> {
        Box::pin(self.export(vm))
    }

    fn lease_status<'a>(
        &'a self,
        lease: &'a LeaseHandle,
    ) -> HypervisorFuture<'a, LeaseStatus, Self::Error> {
        Box::pin(self.status(lease))
    }

    fn lease_progress<'a>(
        &'a self,
        lease: &'a LeaseHandle,
        percent: u8,
    ) -> HypervisorFuture<'a, (), Self::Error> {
        Box::pin(self.progress(lease, percent))
    }

    fn complete_lease(&self, lease: LeaseHandle) -> HypervisorFuture<'_, (), Self::Error> {
        Box::pin(async move { self.complete(&lease).await })
    }

    fn artifact_size<'a>(&'a self, url: &'a str) -> HypervisorFuture<'a, u64, Self::Error> {
        Box::pin(self.head(url))
    }

    fn open_artifact<'a>(
        &'a self,
        url: &'a str,
    ) -> HypervisorFuture<'a, ArtifactStream<Self::Error>, Self::Error> {
        Box::pin(self.download(url))
    }

    fn disconnect(&mut self) -> HypervisorFuture<'_, (), Self::Error> {
        Box::pin(self.logout())
    }
}

/// Host and port as they appear in URLs; the default HTTPS port is omitted.
#[must_use]
pub fn authority(config: &HypervisorConfig) -> String {
    let host = if config.host.contains(':') && !config.host.starts_with('[') {
        format!("[{}]", config.host)
    } else {
        config.host.clone()
    };
    if config.port == 443 {
        host
    } else {
        format!("{host}:{}", config.port)
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.trim_start().starts_with(SESSION_COOKIE))
        .and_then(|value| value.split(';').next())
        .map(|pair| pair.trim().to_owned())
}

#[cfg(test)]
mod tests;
