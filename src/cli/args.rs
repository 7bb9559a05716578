use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};
use geofilter_core::request::{BufferUnit, CombineOperator, EndCap, Predicate};
use geofilter_core::BackendKind;

use super::parse::{parse_backend, parse_buffer_unit, parse_combine, parse_predicate};

/// Which undo timeline a filter is recorded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    /// Global when more than one layer is filtered
    Auto,
    Layer,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EndCapArg {
    Round,
    Flat,
    Square,
}

impl From<EndCapArg> for EndCap {
    fn from(arg: EndCapArg) -> Self {
        match arg {
            EndCapArg::Round => EndCap::Round,
            EndCapArg::Flat => EndCap::Flat,
            EndCapArg::Square => EndCap::Square,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    /// Layers to filter
    #[arg(required = true)]
    pub layers: Vec<String>,

    /// Attribute expression (SQL WHERE syntax)
    #[arg(long = "where", short = 'w')]
    pub where_clause: Option<String>,

    /// Spatial predicate (can be specified multiple times)
    #[arg(long, short, value_parser = parse_predicate, action = clap::ArgAction::Append)]
    pub predicate: Vec<Predicate>,

    /// Reference geometry as WKT
    #[arg(long, conflicts_with = "source_layer")]
    pub source_wkt: Option<String>,

    /// CRS of --source-wkt
    #[arg(long, default_value = "EPSG:4326")]
    pub source_crs: String,

    /// Layer whose features are the reference geometry
    #[arg(long)]
    pub source_layer: Option<String>,

    /// Feature ids of --source-layer (all features when omitted)
    #[arg(long, value_delimiter = ',', requires = "source_layer")]
    pub source_ids: Vec<i64>,

    /// Buffer distance around the reference geometry
    #[arg(long, allow_negative_numbers = true)]
    pub buffer: Option<f64>,

    /// Unit of --buffer
    #[arg(long, value_parser = parse_buffer_unit, default_value = "map")]
    pub buffer_unit: BufferUnit,

    /// Buffer segments per quarter circle
    #[arg(long, default_value_t = 8)]
    pub segments: u32,

    /// Buffer end cap style
    #[arg(long, value_enum, default_value = "round")]
    pub end_cap: EndCapArg,

    /// Merge with the current filter (replace, and, or, and-not)
    #[arg(long, short, value_parser = parse_combine, default_value = "replace")]
    pub combine: CombineOperator,

    /// Force a backend (sql, embedded, generic)
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<BackendKind>,

    /// Undo timeline to record in
    #[arg(long, value_enum, default_value = "auto")]
    pub scope: ScopeArg,

    /// Description stored in the history
    #[arg(long, short)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Geojson,
    Geojsonseq,
}

impl ExportFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Geojson => "geojson",
            ExportFormat::Geojsonseq => "geojsonseq",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Layers to export
    #[arg(required = true)]
    pub layers: Vec<String>,

    /// Output file, or directory with --batch
    #[arg(long, short)]
    pub output: PathBuf,

    /// File format
    #[arg(long = "as", value_enum, default_value = "geojson")]
    pub file_format: ExportFormat,

    /// Reproject to this CRS
    #[arg(long)]
    pub crs: Option<String>,

    /// One file per layer
    #[arg(long)]
    pub batch: bool,

    /// Write a style file next to each output
    #[arg(long)]
    pub style: bool,

    /// Export every feature, ignoring current filters
    #[arg(long)]
    pub all: bool,
}

#[derive(Subcommand, Debug)]
pub enum FavoriteCommands {
    /// Save a filter under a name
    Save {
        /// Favorite name
        name: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// List saved filters
    List,

    /// Run a saved filter
    Apply {
        /// Favorite name
        name: String,

        /// Layers to run it on instead of the saved ones
        layers: Vec<String>,
    },
}
