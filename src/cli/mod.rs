//! CLI argument parsing for geofilter
//!
//! Global flags: --db, --config, --format, --quiet, --verbose

pub mod args;
pub mod output;
pub mod parse;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use args::{ExportArgs, FavoriteCommands, FilterArgs};
pub use output::OutputFormat;

/// Geofilter - spatial and attribute filtering for vector layers
#[derive(Parser, Debug)]
#[command(name = "geofilter")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// SQLite database holding the layers
    #[arg(long, global = true, env = "GEOFILTER_DB")]
    pub db: Option<PathBuf>,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "GEOFILTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "human")]
    pub format: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Log level or filter directive (overrides --verbose)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Seconds to wait for background tasks
    #[arg(long, global = true, default_value_t = 300)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the layers of the database
    Layers,

    /// Check a layer has what filtering needs
    Inspect {
        /// Layer name
        layer: String,
    },

    /// Filter one or more layers
    Filter(FilterArgs),

    /// Step a layer (or the global timeline) back
    Undo {
        /// Layer name; omit with --global
        layer: Option<String>,

        /// Undo the last multi-layer filter
        #[arg(long, conflicts_with = "layer")]
        global: bool,
    },

    /// Step a layer (or the global timeline) forward
    Redo {
        /// Layer name; omit with --global
        layer: Option<String>,

        /// Redo the next multi-layer filter
        #[arg(long, conflicts_with = "layer")]
        global: bool,
    },

    /// Remove the filter of layers
    Reset {
        /// Layer names
        #[arg(required = true)]
        layers: Vec<String>,
    },

    /// Show the filter timeline of a layer, or the global one
    History {
        /// Layer name; global timeline when omitted
        layer: Option<String>,
    },

    /// Distinct values of a field
    Values {
        /// Layer name
        layer: String,

        /// Field name
        field: String,

        /// Ignore the current filter
        #[arg(long)]
        all: bool,

        /// Maximum number of values
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Write filtered layers to files
    Export(ExportArgs),

    /// Saved filters
    #[command(subcommand)]
    Favorites(FavoriteCommands),
}
