//! Outreach CLI - the `outreach` binary.

use anyhow::Result;
use clap::Parser;

use outreach_cli::{Cli, Commands};
use outreach_core::observability::init_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.into());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Drain(args) => outreach_cli::commands::drain::execute(args, cli.format).await,
        }
    })
}
