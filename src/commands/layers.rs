//! `geofilter layers` and `geofilter inspect`

use serde_json::json;

use geofilter_core::dataset::{DatasetId, StorageKind};
use geofilter_core::error::{ExitCode, Result};
use geofilter_core::host::DatasetRegistry;
use geofilter_core::orchestrator::Report;
use geofilter_core::task::MetadataReport;

use crate::cli::output::print_json;
use crate::commands::dispatch::CommandContext;

fn storage_label(storage: StorageKind) -> &'static str {
    match storage {
        StorageKind::Sql => "sql",
        StorageKind::Embedded => "embedded",
        StorageKind::Generic => "generic",
    }
}

pub fn execute_list(ctx: &CommandContext) -> Result<ExitCode> {
    let session = ctx.session()?;
    let layers = session.host.datasets();

    if ctx.json() {
        let rows: Vec<_> = layers
            .iter()
            .map(|layer| {
                json!({
                    "name": layer.id,
                    "storage": storage_label(layer.storage),
                    "features": layer.feature_count,
                    "geometry": layer.geometry_column,
                    "primary_key": layer.primary_key,
                    "crs": layer.crs.authid(),
                    "subset": session.orchestrator.current_subset(&layer.id),
                })
            })
            .collect();
        print_json(&rows)?;
    } else if layers.is_empty() {
        if !ctx.cli.quiet {
            println!("No layers found");
        }
    } else {
        for layer in &layers {
            let mut line = format!(
                "{}  {}  {} features  {}",
                layer.id,
                storage_label(layer.storage),
                layer.feature_count,
                layer.crs
            );
            if let Some(subset) = session.orchestrator.current_subset(&layer.id) {
                line.push_str(&format!("  [filtered: {}]", subset));
            }
            println!("{}", line);
        }
    }
    session.close();
    Ok(ExitCode::Success)
}

fn print_metadata(report: &MetadataReport) {
    println!("{}", report.name);
    println!("  features: {}", report.feature_count);
    println!("  crs: {}", report.crs);
    println!(
        "  backend: {} ({})",
        report.recommended.kind, report.recommended.reason
    );
    if report.missing.is_empty() {
        println!("  filterable: yes");
    } else {
        println!("  missing: {}", report.missing.join(", "));
        if let Some(candidate) = &report.primary_key_candidate {
            println!("  key candidate: {}", candidate);
        }
        println!("  filterable: {}", if report.is_filterable() { "yes" } else { "no" });
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
}

pub fn execute_inspect(ctx: &CommandContext, layer: &str) -> Result<ExitCode> {
    let mut session = ctx.session()?;
    session.orchestrator.submit_layer_metadata(DatasetId::new(layer))?;
    let report = session.wait_one();
    session.close();

    let report = match report? {
        Report::Metadata { result, .. } => result?,
        other => return Err(geofilter_core::FilterError::Other(format!("unexpected report {:?}", other))),
    };
    if ctx.json() {
        print_json(&report)?;
    } else {
        print_metadata(&report);
    }
    Ok(if report.is_filterable() {
        ExitCode::Success
    } else {
        ExitCode::Data
    })
}
