//! Binary entry point for the `vmbackup` CLI.

use std::io::{self, Write};
use std::process;

use chrono::Local;
use clap::Parser;
use thiserror::Error;
use tracing::debug;

use vmbackup::logging::{self, LogConfig};
use vmbackup::{
    BackupConfig, BackupError, BackupOrchestrator, BackupRun, BackupSettings, ConfigError,
    ConsoleProgress, Destination, DestinationMode, ProgressObserver, RunSummary, SettingsError,
    SilentProgress, StorageError, VsphereError, VsphereSession, WebDavStorage, authority,
};

mod cli;

use cli::{Cli, DestinationArg};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("hypervisor client error: {0}")]
    Hypervisor(#[from] VsphereError),
    #[error("remote storage client error: {0}")]
    Storage(#[from] StorageError),
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError<VsphereError>),
}

impl From<DestinationArg> for DestinationMode {
    fn from(value: DestinationArg) -> Self {
        match value {
            DestinationArg::File => Self::File,
            DestinationArg::Cloud => Self::Cloud,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(summary) => {
            writeln!(io::stdout(), "{summary}").ok();
            0
        }
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<RunSummary, CliError> {
    let settings = BackupSettings::load_without_cli_args()?;
    if logging::init(LogConfig {
        json: settings.log_json,
        verbose: cli.verbose,
    })
    .is_err()
    {
        debug!("tracing subscriber already installed");
    }

    let mode = DestinationMode::from(cli.destination);
    let config = BackupConfig::load(&cli.config)?;
    config.require_destination(mode)?;

    let run = BackupRun::new(
        cli.vm_name,
        mode,
        config.storage.local_backup_dir.clone(),
        Local::now().naive_local(),
    );
    let session = VsphereSession::new(&config.esxi)?;
    let host = authority(&config.esxi);
    let progress: Box<dyn ProgressObserver> = if settings.progress {
        Box::new(ConsoleProgress)
    } else {
        Box::new(SilentProgress)
    };

    let summary = match mode {
        DestinationMode::File => {
            BackupOrchestrator::new(session, Destination::<WebDavStorage>::Local, host)
                .with_settings(settings)
                .with_progress(progress)
                .execute(&run)
                .await?
        }
        DestinationMode::Cloud => {
            let remote = config.remote()?;
            let destination = Destination::Cloud {
                storage: WebDavStorage::new(remote)?,
                remote_dir: remote.remote_dir.clone(),
            };
            BackupOrchestrator::new(session, destination, host)
                .with_settings(settings)
                .with_progress(progress)
                .execute(&run)
                .await?
        }
    };
    Ok(summary)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
