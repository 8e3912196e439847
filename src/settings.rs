//! Runtime settings layered via `ortho-config`.
//!
//! These knobs tune how a run behaves rather than what it backs up, so they
//! live outside the YAML configuration file and can be overridden per
//! deployment through `VMBACKUP_*` environment variables.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::transfer::TransferPolicy;

/// Default interval between lease state polls, in milliseconds.
pub const DEFAULT_LEASE_POLL_INTERVAL_MS: u64 = 1_000;

/// Default maximum wait for a lease to become ready, in seconds.
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 1_800;

/// Default maximum interval between lease progress reports, in seconds.
pub const DEFAULT_LEASE_KEEPALIVE_SECS: u64 = 30;

/// Runtime settings merged from defaults and environment variables.
///
/// Flags are `skip_cli` so an absent command-line switch cannot mask the
/// matching environment variable.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "VMBACKUP")]
pub struct BackupSettings {
    /// Interval between lease state polls, in milliseconds.
    #[ortho_config(default = 1_000)]
    pub lease_poll_interval_ms: u64,
    /// Maximum time to wait for a lease to leave the initializing state, in
    /// seconds.
    #[ortho_config(default = 1_800)]
    pub lease_timeout_secs: u64,
    /// Maximum interval between lease progress reports while downloading, in
    /// seconds.
    #[ortho_config(default = 30)]
    pub lease_keepalive_secs: u64,
    /// Aborts the run before archiving or reporting success when any
    /// artifact fails to download.
    #[ortho_config(default = false, skip_cli)]
    pub fail_fast: bool,
    /// Draws per-artifact progress bars on the terminal.
    #[ortho_config(default = true, skip_cli)]
    pub progress: bool,
    /// Emits logs as JSON lines instead of human-readable text.
    #[ortho_config(default = false, skip_cli)]
    pub log_json: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            lease_poll_interval_ms: DEFAULT_LEASE_POLL_INTERVAL_MS,
            lease_timeout_secs: DEFAULT_LEASE_TIMEOUT_SECS,
            lease_keepalive_secs: DEFAULT_LEASE_KEEPALIVE_SECS,
            fail_fast: false,
            progress: true,
            log_json: false,
        }
    }
}

impl BackupSettings {
    /// Loads settings without parsing CLI arguments. Values merge defaults,
    /// configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails, or
    /// [`SettingsError::Invalid`] when a value fails validation.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        let settings = Self::load_from_iter([OsString::from("vmbackup")])
            .map_err(|err| SettingsError::Parse(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects zero intervals and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Invalid`] naming the offending field.
    pub const fn validate(&self) -> Result<(), SettingsError> {
        if self.lease_poll_interval_ms == 0 {
            return Err(SettingsError::Invalid("lease_poll_interval_ms"));
        }
        if self.lease_timeout_secs == 0 {
            return Err(SettingsError::Invalid("lease_timeout_secs"));
        }
        if self.lease_keepalive_secs == 0 {
            return Err(SettingsError::Invalid("lease_keepalive_secs"));
        }
        Ok(())
    }

    /// Interval between lease state polls.
    #[must_use]
    pub const fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_interval_ms)
    }

    /// Maximum wait for lease readiness.
    #[must_use]
    pub const fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Maximum interval between lease progress reports.
    #[must_use]
    pub const fn lease_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.lease_keepalive_secs)
    }

    /// Policy applied when individual artifacts fail.
    #[must_use]
    pub const fn transfer_policy(&self) -> TransferPolicy {
        if self.fail_fast {
            TransferPolicy::FailFast
        } else {
            TransferPolicy::BestEffort
        }
    }
}

/// Errors raised while loading runtime settings.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("runtime settings parsing failed: {0}")]
    Parse(String),
    /// Raised when a value is out of range.
    #[error("{0} must be greater than zero: set VMBACKUP_{upper}", upper = .0.to_uppercase())]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;

    #[test]
    fn defaults_are_valid() {
        let settings = BackupSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.lease_poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.transfer_policy(), TransferPolicy::BestEffort);
    }

    #[test]
    fn zero_interval_is_rejected_with_env_hint() {
        let settings = BackupSettings {
            lease_poll_interval_ms: 0,
            ..BackupSettings::default()
        };
        let err = settings.validate().expect_err("zero interval should fail");
        assert!(
            err.to_string().contains("VMBACKUP_LEASE_POLL_INTERVAL_MS"),
            "message: {err}"
        );
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("VMBACKUP_FAIL_FAST", "true"),
            ("VMBACKUP_LEASE_TIMEOUT_SECS", "60"),
        ])
        .await;

        let settings =
            BackupSettings::load_without_cli_args().expect("settings should load from env");

        assert!(settings.fail_fast);
        assert_eq!(settings.lease_timeout(), Duration::from_secs(60));
        assert_eq!(settings.transfer_policy(), TransferPolicy::FailFast);
    }

    #[tokio::test]
    async fn environment_can_flip_default_on_flags_off() {
        let _guard = EnvGuard::set_vars(&[
            ("VMBACKUP_PROGRESS", "false"),
            ("VMBACKUP_LOG_JSON", "true"),
            ("VMBACKUP_LEASE_KEEPALIVE_SECS", "5"),
        ])
        .await;

        let settings =
            BackupSettings::load_without_cli_args().expect("settings should load from env");

        assert!(!settings.progress);
        assert!(settings.log_json);
        assert!(!settings.fail_fast);
        assert_eq!(settings.lease_keepalive_interval(), Duration::from_secs(5));
    }

    #[test]
    fn zero_keepalive_is_rejected() {
        let settings = BackupSettings {
            lease_keepalive_secs: 0,
            ..BackupSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SettingsError::Invalid("lease_keepalive_secs"))
        );
    }
}
