//! `geofilter filter`

use serde_json::json;

use geofilter_core::dataset::{Crs, DatasetId};
use geofilter_core::error::{ExitCode, Result};
use geofilter_core::orchestrator::Report;
use geofilter_core::request::{BufferSpec, BufferStyle, SourceGeometry};
use geofilter_core::{DatasetReport, FilterRequest, HistoryScope, ReportStatus, RequestHandle};

use crate::cli::args::{FilterArgs, ScopeArg};
use crate::cli::output::print_json;
use crate::commands::dispatch::CommandContext;
use crate::commands::session::Session;

/// Turn command line arguments into a request
pub fn build_request(args: &FilterArgs) -> FilterRequest {
    let mut request = FilterRequest::new(args.layers.iter().cloned()).with_combine(args.combine);
    if let Some(expression) = &args.where_clause {
        request = request.with_attribute(expression);
    }
    for predicate in &args.predicate {
        request = request.with_predicate(*predicate);
    }
    if let Some(wkt) = &args.source_wkt {
        request = request.with_source(SourceGeometry::Wkt {
            wkt: wkt.clone(),
            crs: Crs::new(&args.source_crs),
        });
    } else if let Some(layer) = &args.source_layer {
        let source = if args.source_ids.is_empty() {
            SourceGeometry::Selection {
                dataset: DatasetId::new(layer),
                feature_ids: None,
            }
        } else {
            SourceGeometry::features(layer, args.source_ids.clone())
        };
        request = request.with_source(source);
    }
    if let Some(distance) = args.buffer {
        request = request.with_buffer(BufferSpec::new(distance, args.buffer_unit).with_style(BufferStyle {
            segments: args.segments.max(1),
            end_cap: args.end_cap.into(),
        }));
    }
    if let Some(backend) = args.backend {
        request = request.with_backend(backend);
    }
    request = request.with_history_scope(match args.scope {
        ScopeArg::Auto => HistoryScope::Auto,
        ScopeArg::Layer => HistoryScope::Dataset,
        ScopeArg::Global => HistoryScope::Global,
    });
    if let Some(description) = &args.description {
        request = request.with_description(description);
    }
    request
}

pub fn status_label(status: ReportStatus) -> &'static str {
    match status {
        ReportStatus::Applied => "applied",
        ReportStatus::Failed => "failed",
        ReportStatus::Canceled => "canceled",
        ReportStatus::Superseded => "superseded",
        ReportStatus::Unavailable => "unavailable",
    }
}

/// Worst exit code among the dataset reports
pub fn worst_code(reports: &[DatasetReport]) -> ExitCode {
    match reports.iter().filter_map(|r| r.code).max() {
        None | Some(0) => ExitCode::Success,
        Some(2) => ExitCode::Usage,
        Some(3) => ExitCode::Data,
        Some(4) => ExitCode::Transient,
        Some(_) => ExitCode::Failure,
    }
}

fn print_human(ctx: &CommandContext, handle: &RequestHandle, reports: &[DatasetReport]) {
    let quiet = ctx.cli.quiet;
    for warning in handle.warnings.iter().filter(|_| !quiet) {
        eprintln!("warning: {}", warning);
    }
    for report in reports {
        match report.status {
            ReportStatus::Applied => {
                let backend = report.backend.map(|b| b.to_string()).unwrap_or_default();
                let fallback = if report.fallback { ", fallback" } else { "" };
                match report.feature_count {
                    Some(count) => println!("{}: {} features ({}{})", report.dataset, count, backend, fallback),
                    None => println!("{}: filtered ({}{})", report.dataset, backend, fallback),
                }
                if ctx.cli.verbose {
                    if let Some(subset) = &report.subset {
                        println!("  subset: {}", subset);
                    }
                }
            }
            status => match &report.error {
                Some(error) => println!("{}: {}: {}", report.dataset, status_label(status), error),
                None => println!("{}: {}", report.dataset, status_label(status)),
            },
        }
        for warning in report.warnings.iter().filter(|_| !quiet) {
            eprintln!("  warning: {}", warning);
        }
    }
}

/// Wait for a submitted request and report every dataset
pub fn finish_request(ctx: &CommandContext, session: &mut Session, handle: RequestHandle) -> Result<ExitCode> {
    let reports: Vec<DatasetReport> = session
        .wait()
        .into_iter()
        .filter_map(|report| match report {
            Report::Filter(report) => Some(report),
            _ => None,
        })
        .collect();
    tracing::debug!(request = handle.id, elapsed = ?ctx.start.elapsed(), "request finished");

    if ctx.json() {
        print_json(&json!({
            "request": handle.id,
            "warnings": handle.warnings,
            "reports": reports,
        }))?;
    } else {
        print_human(ctx, &handle, &reports);
    }
    Ok(worst_code(&reports))
}

pub fn execute(ctx: &CommandContext, args: &FilterArgs) -> Result<ExitCode> {
    let request = build_request(args);
    request.validate()?;
    let mut session = ctx.session()?;
    let handle = session.orchestrator.submit_filter(request)?;
    tracing::debug!(request = handle.id, tasks = handle.tasks.len(), "request submitted");
    let code = finish_request(ctx, &mut session, handle);
    session.close();
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use geofilter_core::request::{BufferUnit, CombineOperator, EndCap};
    use geofilter_core::Predicate;

    fn parse(argv: &[&str]) -> FilterArgs {
        match Cli::parse_from(argv).command {
            Some(Commands::Filter(args)) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_build_spatial_request() {
        let args = parse(&[
            "geofilter", "filter", "roads", "rivers", "-p", "intersects", "--source-wkt",
            "POINT (1 2)", "--buffer", "-5", "--buffer-unit", "m", "--end-cap", "flat", "-c", "and",
        ]);
        let request = build_request(&args);
        assert_eq!(request.targets.len(), 2);
        assert_eq!(request.predicates, vec![Predicate::Intersects]);
        assert_eq!(request.combine, CombineOperator::And);
        let buffer = request.buffer.unwrap();
        assert_eq!(buffer.distance, -5.0);
        assert_eq!(buffer.unit, BufferUnit::Meters);
        assert_eq!(buffer.style.end_cap, EndCap::Flat);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_build_selection_source() {
        let args = parse(&[
            "geofilter", "filter", "towns", "-p", "within", "--source-layer", "regions",
            "--source-ids", "1,2", "--scope", "global",
        ]);
        let request = build_request(&args);
        assert_eq!(request.source, Some(SourceGeometry::features("regions", vec![1, 2])));
        assert_eq!(request.history_scope, HistoryScope::Global);
    }

    #[test]
    fn test_worst_code_of_nothing() {
        assert_eq!(worst_code(&[]), ExitCode::Success);
    }
}
