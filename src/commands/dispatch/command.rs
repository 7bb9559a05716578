//! Command trait and context for dispatching commands

use std::time::Instant;

use geofilter_core::error::{ExitCode, Result};

use crate::cli::{Cli, OutputFormat};
use crate::commands::session::Session;

/// Shared context for command execution
pub struct CommandContext<'a> {
    pub cli: &'a Cli,
    pub start: Instant,
}

impl<'a> CommandContext<'a> {
    pub fn new(cli: &'a Cli, start: Instant) -> Self {
        Self { cli, start }
    }

    pub fn json(&self) -> bool {
        self.cli.format == OutputFormat::Json
    }

    /// Open the database and the engine over it
    pub fn session(&self) -> Result<Session> {
        Session::open(self.cli)
    }
}

/// Trait for commands that can be executed
pub trait Command {
    fn execute(&self, ctx: &CommandContext) -> Result<ExitCode>;
}

/// No-op command (when no subcommand is provided)
pub struct NoCommand;

impl Command for NoCommand {
    fn execute(&self, _ctx: &CommandContext) -> Result<ExitCode> {
        println!("geofilter {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Spatial and attribute filtering for vector layers.");
        println!();
        println!("Run `geofilter --help` for usage information.");
        Ok(ExitCode::Success)
    }
}
