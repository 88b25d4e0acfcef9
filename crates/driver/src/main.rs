//! Tiling-optimizer executable.

use anyhow::Result;
use clap::Parser;
use tilescout_driver::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
