//! WebDAV client for Nextcloud-style storage endpoints.

use camino::Utf8Path;
use reqwest::header::{CONTENT_LENGTH, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

use super::{RemoteEntry, RemoteStorage, StorageError, StorageFuture, remote_components};
use crate::config::RemoteConfig;
use crate::xml::Element;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/><d:getcontentlength/></d:prop></d:propfind>"#;

/// Remote storage backed by a WebDAV endpoint with basic authentication.
#[derive(Clone, Debug)]
pub struct WebDavStorage {
    client: Client,
    base: Url,
    user: String,
    password: String,
}

impl WebDavStorage {
    /// Builds a client for the endpoint described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Protocol`] when the URL is invalid or the HTTP
    /// client cannot be constructed.
    pub fn new(config: &RemoteConfig) -> Result<Self, StorageError> {
        let base = Url::parse(&config.url).map_err(|err| StorageError::Protocol {
            message: format!("invalid remote storage URL {}: {err}", config.url),
        })?;
        if base.cannot_be_a_base() {
            return Err(StorageError::Protocol {
                message: format!("remote storage URL {} cannot hold paths", config.url),
            });
        }
        let client = Client::builder()
            .build()
            .map_err(|err| StorageError::Protocol {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn url_for(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(remote_components(path));
        }
        url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url_for(path))
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn propfind(&self, path: &str) -> Result<Option<Response>, StorageError> {
        let method = dav_method(b"PROPFIND")?;
        let response = self
            .request(method, path)
            .header("Depth", "0")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(status_error(status, path)),
        }
    }

    async fn info_at(&self, path: &str) -> Result<RemoteEntry, StorageError> {
        let response = self.propfind(path).await?.ok_or_else(|| StorageError::Status {
            code: StatusCode::NOT_FOUND.as_u16(),
            path: path.to_owned(),
        })?;
        let body = response.text().await.map_err(transport)?;
        parse_propfind(path, &body)
    }

    async fn exists_at(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.propfind(path).await?.is_some())
    }

    async fn mkdir_at(&self, path: &str) -> Result<(), StorageError> {
        let mut current = String::new();
        for component in remote_components(path) {
            current = super::remote_join(&current, component);
            if self.exists_at(&current).await? {
                continue;
            }
            debug!(path = %current, "creating remote directory");
            let response = self
                .request(dav_method(b"MKCOL")?, &current)
                .send()
                .await
                .map_err(transport)?;
            let status = response.status();
            if !(status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED) {
                return Err(status_error(status, &current));
            }
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Utf8Path, remote: &str) -> Result<(), StorageError> {
        let local_error = |err: std::io::Error| StorageError::LocalFile {
            path: local.to_string(),
            message: err.to_string(),
        };
        let file = tokio::fs::File::open(local).await.map_err(local_error)?;
        let length = file.metadata().await.map_err(local_error)?.len();

        debug!(local = %local, remote, bytes = length, "uploading file");
        let response = self
            .request(Method::PUT, remote)
            .header(CONTENT_LENGTH, HeaderValue::from(length))
            .body(reqwest::Body::from(file))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, remote))
        }
    }

    async fn delete_file(&self, remote: &str) -> Result<(), StorageError> {
        let response = self
            .request(Method::DELETE, remote)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, remote))
        }
    }
}

impl RemoteStorage for WebDavStorage {
    fn info<'a>(&'a self, path: &'a str) -> StorageFuture<'a, RemoteEntry> {
        Box::pin(self.info_at(path))
    }

    fn exists<'a>(&'a self, path: &'a str) -> StorageFuture<'a, bool> {
        Box::pin(self.exists_at(path))
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(self.mkdir_at(path))
    }

    fn upload<'a>(&'a self, local: &'a Utf8Path, remote: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(self.upload_file(local, remote))
    }

    fn delete<'a>(&'a self, remote: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(self.delete_file(remote))
    }
}

fn dav_method(name: &[u8]) -> Result<Method, StorageError> {
    Method::from_bytes(name).map_err(|err| StorageError::Protocol {
        message: err.to_string(),
    })
}

fn transport(err: reqwest::Error) -> StorageError {
    StorageError::NotConnected {
        message: err.to_string(),
    }
}

fn status_error(status: StatusCode, path: &str) -> StorageError {
    StorageError::Status {
        code: status.as_u16(),
        path: path.to_owned(),
    }
}

/// Extracts entry metadata from a `PROPFIND` multistatus body.
fn parse_propfind(path: &str, body: &str) -> Result<RemoteEntry, StorageError> {
    let document = Element::parse(body).map_err(|err| StorageError::Protocol {
        message: err.to_string(),
    })?;
    let response = document
        .find("response")
        .ok_or_else(|| StorageError::Protocol {
            message: format!("PROPFIND for {path} returned no response element"),
        })?;
    let is_dir = response
        .find("resourcetype")
        .is_some_and(|kind| kind.child("collection").is_some());
    let size_bytes = response
        .find("getcontentlength")
        .and_then(|length| length.text().parse().ok());
    Ok(RemoteEntry {
        path: path.to_owned(),
        is_dir,
        size_bytes,
    })
}
