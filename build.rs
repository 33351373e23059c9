//! Build script for generating the `longhorn-volume-manager` man page.
//!
//! The page is rendered from the same clap definitions the binary parses, so
//! every flag and environment fallback documented there stays in sync.

use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR").map(PathBuf::from).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?;

    let mut page = Vec::new();
    Man::new(Cli::command()).render(&mut page)?;
    fs::write(out_dir.join("longhorn-volume-manager.1"), page)?;

    Ok(())
}
