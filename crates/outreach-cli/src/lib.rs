//! # outreach-cli
//!
//! Command-line interface for outreach drain runs.
//!
//! ## Commands
//!
//! - `outreach drain` - Classify enrolled leads, record outcomes, and delete drained leads
//!
//! ## Configuration
//!
//! Every flag has an environment variable, so scheduled runs need no arguments:
//!
//! - `OUTREACH_API_URL` - Campaign platform base URL
//! - `INSTANTLY_API_KEY` - Platform API key (fallback: `config/secrets/instantly-config.json`)
//! - `GCP_PROJECT_ID` / `BIGQUERY_DATASET` - State store location
//! - `OUTREACH_CAMPAIGNS` - Comma-separated `name=id` pairs
//! - `DRY_RUN` / `FORCE_DRAIN_CHECK` - Run mode switches

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod secrets;

use clap::{Parser, Subcommand};
use outreach_core::observability::LogFormat;

/// Outreach CLI - campaign hygiene from the command line.
#[derive(Debug, Parser)]
#[command(name = "outreach")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Report output format.
    #[arg(long, env = "OUTREACH_OUTPUT_FORMAT", default_value = "text")]
    pub format: OutputFormat,

    /// Log output format.
    #[arg(long, env = "OUTREACH_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one drain pass over the configured campaigns.
    Drain(commands::drain::DrainArgs),
}

/// Report output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable logs.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "outreach",
            "--format",
            "json",
            "--log-format",
            "json",
            "drain",
            "--project-id",
            "proj",
            "--campaign",
            "SMB=c-1",
        ]);

        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(LogFormat::from(cli.log_format), LogFormat::Json);
        let Commands::Drain(args) = cli.command;
        assert_eq!(args.project_id, "proj");
        assert_eq!(args.campaigns, ["SMB=c-1"]);
    }
}
