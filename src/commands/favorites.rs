//! `geofilter favorites`

use serde_json::json;

use geofilter_core::dataset::DatasetId;
use geofilter_core::error::{ExitCode, Result};
use geofilter_core::favorites::Favorite;

use crate::cli::args::FavoriteCommands;
use crate::cli::output::print_json;
use crate::commands::dispatch::CommandContext;
use crate::commands::filter::{build_request, finish_request};

pub fn execute(ctx: &CommandContext, command: &FavoriteCommands) -> Result<ExitCode> {
    match command {
        FavoriteCommands::Save { name, filter } => {
            let request = build_request(filter);
            request.validate()?;
            let mut favorite = Favorite::new(name, request)?;
            if let Some(description) = &filter.description {
                favorite = favorite.with_description(description);
            }
            let session = ctx.session()?;
            let saved = session.orchestrator.save_favorite(&favorite);
            session.close();
            saved?;
            if ctx.json() {
                print_json(&json!({ "saved": favorite.name }))?;
            } else if !ctx.cli.quiet {
                println!("Saved favorite '{}'", favorite.name);
            }
            Ok(ExitCode::Success)
        }
        FavoriteCommands::List => {
            let session = ctx.session()?;
            let favorites = session.orchestrator.favorites();
            session.close();
            let favorites = favorites?;
            if ctx.json() {
                print_json(&favorites)?;
            } else if favorites.is_empty() {
                println!("No favorites");
            } else {
                for favorite in &favorites {
                    let targets: Vec<String> = favorite.request.targets.iter().map(|t| t.to_string()).collect();
                    println!(
                        "{}  [{}]  {}",
                        favorite.name,
                        targets.join(", "),
                        favorite.description.clone().unwrap_or_else(|| favorite.request.summary())
                    );
                }
            }
            Ok(ExitCode::Success)
        }
        FavoriteCommands::Apply { name, layers } => {
            let targets = (!layers.is_empty()).then(|| layers.iter().map(DatasetId::new).collect());
            let mut session = ctx.session()?;
            let handle = session.orchestrator.apply_favorite(name, targets);
            let code = match handle {
                Ok(handle) => finish_request(ctx, &mut session, handle),
                Err(e) => Err(e),
            };
            session.close();
            code
        }
    }
}
