//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Mailbox-driven download and library-integration pipeline for fanfiction stories.
#[derive(Parser, Debug)]
#[command(name = "fanfic-pipeline")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "./config.default/config.toml")]
    pub config: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
