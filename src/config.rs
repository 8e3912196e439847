//! Configuration file loading and validation.
//!
//! The configuration file is YAML with an `esxi` section for the hypervisor,
//! a `storage` section for local backups, and a `nextcloud` section that is
//! only required when uploading to the remote storage service.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use thiserror::Error;

use crate::run::DestinationMode;

const ESXI_SECTION: &str = "esxi";
const STORAGE_SECTION: &str = "storage";
const NEXTCLOUD_SECTION: &str = "nextcloud";
const DEFAULT_HTTPS_PORT: u16 = 443;

/// Hypervisor connection settings from the `esxi` section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct HypervisorConfig {
    /// Host name or address of the ESXi host.
    pub host: String,
    /// Account used to log in.
    pub user: String,
    /// Password for `user`.
    pub password: String,
    /// HTTPS port of the SDK endpoint.
    #[serde(default = "default_https_port")]
    pub port: u16,
    /// Skips TLS certificate verification for the SDK endpoint and artifact
    /// downloads. Self-signed host certificates are common, but the bypass
    /// must be requested explicitly.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Local storage settings from the `storage` section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory receiving per-run backup directories.
    pub local_backup_dir: Utf8PathBuf,
}

/// Remote storage settings from the `nextcloud` section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// WebDAV endpoint of the remote storage service.
    pub url: String,
    /// Account used to authenticate.
    pub user: String,
    /// Password or application token for `user`.
    pub password: String,
    /// Remote directory receiving backup archives.
    pub remote_dir: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    esxi: Option<HypervisorConfig>,
    storage: Option<StorageConfig>,
    nextcloud: Option<RemoteConfig>,
}

/// Validated configuration for a backup run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupConfig {
    /// Hypervisor connection settings.
    pub esxi: HypervisorConfig,
    /// Local storage settings.
    pub storage: StorageConfig,
    /// Remote storage settings, present when the file declares them.
    pub nextcloud: Option<RemoteConfig>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, key: &'static str, section: &'static str) -> Self {
        Self {
            description,
            key,
            section,
        }
    }
}

const fn default_https_port() -> u16 {
    DEFAULT_HTTPS_PORT
}

impl BackupConfig {
    /// Reads and validates the configuration file at `path`.
    ///
    /// No network activity happens here; a run that fails to load its
    /// configuration never touches the hypervisor or the remote storage.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when the file is absent,
    /// [`ConfigError::Io`] when it cannot be read, and the errors of
    /// [`BackupConfig::from_yaml`] otherwise.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let file_name = path.file_name().ok_or_else(|| ConfigError::NotFound {
            path: path.to_path_buf(),
        })?;

        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                }
            }
        })?;

        if !dir.try_exists(file_name).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })? {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| ConfigError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed YAML,
    /// [`ConfigError::MissingSection`] when `esxi` or `storage` is absent, and
    /// [`ConfigError::MissingField`] when a required value is blank.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let esxi = raw
            .esxi
            .ok_or(ConfigError::MissingSection(ESXI_SECTION))?;
        let storage = raw
            .storage
            .ok_or(ConfigError::MissingSection(STORAGE_SECTION))?;

        let config = Self {
            esxi,
            storage,
            nextcloud: raw.nextcloud,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that everything `mode` needs is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] when `mode` is
    /// [`DestinationMode::Cloud`] and no `nextcloud` section exists.
    pub fn require_destination(&self, mode: DestinationMode) -> Result<(), ConfigError> {
        if mode == DestinationMode::Cloud && self.nextcloud.is_none() {
            return Err(ConfigError::MissingSection(NEXTCLOUD_SECTION));
        }
        Ok(())
    }

    /// Returns the remote storage section required by cloud mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] when the section is absent.
    pub fn remote(&self) -> Result<&RemoteConfig, ConfigError> {
        self.nextcloud
            .as_ref()
            .ok_or(ConfigError::MissingSection(NEXTCLOUD_SECTION))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the YAML key and section
    /// of the first blank value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.esxi.host,
            &FieldMetadata::new("ESXi host", "host", ESXI_SECTION),
        )?;
        require_field(
            &self.esxi.user,
            &FieldMetadata::new("ESXi user", "user", ESXI_SECTION),
        )?;
        require_field(
            &self.esxi.password,
            &FieldMetadata::new("ESXi password", "password", ESXI_SECTION),
        )?;
        require_field(
            self.storage.local_backup_dir.as_str(),
            &FieldMetadata::new("local backup directory", "local_backup_dir", STORAGE_SECTION),
        )?;

        if let Some(remote) = &self.nextcloud {
            require_field(
                &remote.url,
                &FieldMetadata::new("remote storage URL", "url", NEXTCLOUD_SECTION),
            )?;
            require_field(
                &remote.user,
                &FieldMetadata::new("remote storage user", "user", NEXTCLOUD_SECTION),
            )?;
            require_field(
                &remote.password,
                &FieldMetadata::new("remote storage password", "password", NEXTCLOUD_SECTION),
            )?;
            require_field(
                &remote.remote_dir,
                &FieldMetadata::new("remote directory", "remote_dir", NEXTCLOUD_SECTION),
            )?;
        }
        Ok(())
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: add {} to the {} section of the configuration file",
            metadata.description, metadata.key, metadata.section
        )));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the configuration file does not exist.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path that was requested.
        path: Utf8PathBuf,
    },
    /// Raised when the configuration file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the YAML cannot be parsed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a required section is absent.
    #[error("configuration is missing the required '{0}' section")]
    MissingSection(&'static str),
    /// Indicates a required configuration field is empty.
    #[error("missing configuration field: {0}")]
    MissingField(String),
}
