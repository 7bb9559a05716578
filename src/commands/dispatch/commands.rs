//! Command implementations for all geofilter commands

use geofilter_core::error::{ExitCode, Result};

use crate::cli::Commands;
use crate::commands::dispatch::command::{Command, CommandContext};
use crate::commands::{export, favorites, filter, history, layers, values};

impl Command for Commands {
    fn execute(&self, ctx: &CommandContext) -> Result<ExitCode> {
        match self {
            Commands::Layers => layers::execute_list(ctx),
            Commands::Inspect { layer } => layers::execute_inspect(ctx, layer),
            Commands::Filter(args) => filter::execute(ctx, args),
            Commands::Undo { layer, global } => {
                history::execute_step(ctx, layer.as_deref(), *global, history::Step::Undo)
            }
            Commands::Redo { layer, global } => {
                history::execute_step(ctx, layer.as_deref(), *global, history::Step::Redo)
            }
            Commands::Reset { layers } => history::execute_reset(ctx, layers),
            Commands::History { layer } => history::execute_show(ctx, layer.as_deref()),
            Commands::Values {
                layer,
                field,
                all,
                limit,
            } => values::execute(ctx, layer, field, *all, *limit),
            Commands::Export(args) => export::execute(ctx, args),
            Commands::Favorites(command) => favorites::execute(ctx, command),
        }
    }
}
