//! Renders the `vmbackup(1)` manual page from the clap definitions.

use std::io::{self, Write};
use std::path::PathBuf;
use std::{env, fs};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

const MAN_PAGE: &str = "vmbackup.1";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut cargo = io::stdout().lock();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(cargo, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR is not set"))?;

    let mut page = Vec::new();
    Man::new(cli::Cli::command()).render(&mut page)?;
    fs::write(out_dir.join(MAN_PAGE), page)?;

    Ok(())
}
