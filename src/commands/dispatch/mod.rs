//! Command dispatch logic for geofilter

use std::time::Instant;

use geofilter_core::error::{ExitCode, Result};
use tracing::debug;

use crate::cli::Cli;

mod command;
mod commands;

pub use command::{Command, CommandContext, NoCommand};

pub fn run(cli: &Cli, start: Instant) -> Result<ExitCode> {
    let ctx = CommandContext::new(cli, start);
    debug!(elapsed = ?start.elapsed(), "dispatch");

    match &cli.command {
        None => NoCommand.execute(&ctx),
        Some(cmd) => cmd.execute(&ctx),
    }
}
