//! Command-line interface definitions for the `vmbackup` binary.
//!
//! Kept free of library imports because `build.rs` includes this file
//! directly to render the manual page.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};

/// Top-level CLI for the `vmbackup` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vmbackup",
    about = "Export a virtual machine from an ESXi host and store or upload the backup",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, value_name = "PATH")]
    pub(crate) config: Utf8PathBuf,
    /// Exact name of the virtual machine to back up.
    #[arg(long = "vm-name", value_name = "NAME")]
    pub(crate) vm_name: String,
    /// Keep the backup locally (`file`) or archive and upload it (`cloud`).
    #[arg(long, value_enum, value_name = "DESTINATION")]
    pub(crate) destination: DestinationArg,
    /// Enable debug logging.
    #[arg(long, short)]
    pub(crate) verbose: bool,
}

/// Destination accepted on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum DestinationArg {
    /// Keep the exported files in a local run directory.
    File,
    /// Archive the run directory and upload it to remote storage.
    Cloud,
}
