//! `geofilter undo|redo|reset|history`

use serde_json::json;

use geofilter_core::dataset::DatasetId;
use geofilter_core::error::{ExitCode, Result};
use geofilter_core::history::HistoryEntry;
use geofilter_core::{bail_invalid, Replay};

use crate::cli::output::print_json;
use crate::commands::dispatch::CommandContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Undo,
    Redo,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Undo => "undo",
            Step::Redo => "redo",
        }
    }
}

fn describe(entry: &HistoryEntry) -> String {
    if entry.is_unfiltered() {
        return "no filter".to_string();
    }
    match entry.feature_count {
        Some(count) => format!("{} ({} features)", entry.description, count),
        None => entry.description.clone(),
    }
}

fn print_warnings(ctx: &CommandContext, replay: &Replay) {
    for warning in replay.warnings.iter().filter(|_| !ctx.cli.quiet) {
        eprintln!("warning: {}", warning);
    }
}

fn print_replay(ctx: &CommandContext, step: Step, replay: &Replay) -> Result<()> {
    if ctx.json() {
        return print_json(&json!({
            "action": step.name(),
            "applied": replay.entries,
            "warnings": replay.warnings,
        }));
    }
    print_warnings(ctx, replay);
    let entries = &replay.entries;
    if entries.is_empty() {
        if !ctx.cli.quiet {
            println!("Nothing to {}", step.name());
        }
        return Ok(());
    }
    for entry in entries {
        println!("{}: {}", entry.dataset, describe(entry));
    }
    Ok(())
}

pub fn execute_step(ctx: &CommandContext, layer: Option<&str>, global: bool, step: Step) -> Result<ExitCode> {
    let layer = match layer {
        Some(layer) => Some(DatasetId::new(layer)),
        None if global => None,
        None => bail_invalid!(step.name(), "give a layer or --global"),
    };
    let mut session = ctx.session()?;
    let orchestrator = &mut session.orchestrator;
    let applied = match (layer, step) {
        (None, Step::Undo) => orchestrator.undo_global(),
        (None, Step::Redo) => orchestrator.redo_global(),
        (Some(layer), Step::Undo) => orchestrator.undo(&layer),
        (Some(layer), Step::Redo) => orchestrator.redo(&layer),
    };
    session.close();
    print_replay(ctx, step, &applied?.unwrap_or_default())?;
    Ok(ExitCode::Success)
}

pub fn execute_reset(ctx: &CommandContext, layers: &[String]) -> Result<ExitCode> {
    let mut session = ctx.session()?;
    let ids: Vec<DatasetId> = layers.iter().map(DatasetId::new).collect();
    let replay = session.orchestrator.reset(&ids);
    session.close();
    let replay = replay?;

    if ctx.json() {
        print_json(&replay)?;
    } else if !ctx.cli.quiet {
        print_warnings(ctx, &replay);
        for entry in &replay.entries {
            println!("{}: filter removed", entry.dataset);
        }
    }
    Ok(ExitCode::Success)
}

fn show_layer(ctx: &CommandContext, layer: &str) -> Result<()> {
    let session = ctx.session()?;
    let id = DatasetId::new(layer);
    let Some(history) = session.orchestrator.history(&id) else {
        if ctx.json() {
            print_json(&json!({ "dataset": id, "cursor": 0, "entries": [] }))?;
        } else {
            println!("{}: no history", id);
        }
        session.close();
        return Ok(());
    };

    if ctx.json() {
        print_json(&json!({
            "dataset": id,
            "cursor": history.cursor(),
            "entries": history.entries(),
        }))?;
    } else {
        let cursor = history.cursor();
        println!("{} 0  no filter", if cursor == 0 { "*" } else { " " });
        for (i, entry) in history.entries().iter().enumerate() {
            let marker = if i + 1 == cursor { "*" } else { " " };
            println!(
                "{} {}  {}  {}",
                marker,
                i + 1,
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                describe(entry)
            );
        }
    }
    session.close();
    Ok(())
}

fn show_global(ctx: &CommandContext) -> Result<()> {
    let session = ctx.session()?;
    let global = session.orchestrator.global_history();

    if ctx.json() {
        print_json(&json!({
            "cursor": global.cursor(),
            "snapshots": global.snapshots(),
        }))?;
    } else if global.snapshots().is_empty() {
        println!("No global history");
    } else {
        for (i, snapshot) in global.snapshots().iter().enumerate() {
            let marker = if i + 1 == global.cursor() { "*" } else { " " };
            let layers: Vec<String> = snapshot.entries.keys().map(|d| d.to_string()).collect();
            println!(
                "{} {}  {}  {}  [{}]",
                marker,
                i + 1,
                snapshot.timestamp.format("%Y-%m-%d %H:%M:%S"),
                snapshot.description,
                layers.join(", ")
            );
        }
    }
    session.close();
    Ok(())
}

pub fn execute_show(ctx: &CommandContext, layer: Option<&str>) -> Result<ExitCode> {
    match layer {
        Some(layer) => show_layer(ctx, layer)?,
        None => show_global(ctx)?,
    }
    Ok(ExitCode::Success)
}
