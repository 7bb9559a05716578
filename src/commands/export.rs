//! `geofilter export`

use geofilter_core::dataset::{Crs, DatasetId};
use geofilter_core::error::{ExitCode, FilterError, Result};
use geofilter_core::orchestrator::Report;
use geofilter_core::task::{ExportRequest, ExportSummary};

use crate::cli::args::ExportArgs;
use crate::cli::output::print_json;
use crate::commands::dispatch::CommandContext;

pub fn build_request(args: &ExportArgs) -> ExportRequest {
    let datasets: Vec<DatasetId> = args.layers.iter().map(DatasetId::new).collect();
    let mut request = ExportRequest::new(datasets.clone(), &args.output, args.file_format.name());
    request.target_crs = args.crs.as_deref().map(Crs::new);
    request.batch = args.batch;
    request.style = args.style;
    if args.all {
        // an explicit empty subset keeps the current filter out
        request.subsets = datasets.into_iter().map(|d| (d, String::new())).collect();
    }
    request
}

fn print_summary(ctx: &CommandContext, summary: &ExportSummary) -> Result<()> {
    if ctx.json() {
        return print_json(summary);
    }
    for (dataset, count) in &summary.features {
        println!("{}: {} features", dataset, count);
    }
    for file in &summary.files {
        println!("wrote {}", file.display());
    }
    if !ctx.cli.quiet {
        for warning in &summary.warnings {
            eprintln!("warning: {}", warning);
        }
    }
    Ok(())
}

pub fn execute(ctx: &CommandContext, args: &ExportArgs) -> Result<ExitCode> {
    let mut session = ctx.session()?;
    session.orchestrator.submit_export(build_request(args))?;
    let report = session.wait_one();
    session.close();

    let summary = match report? {
        Report::Export { result, .. } => result?,
        other => return Err(FilterError::Other(format!("unexpected report {:?}", other))),
    };
    print_summary(ctx, &summary)?;
    Ok(ExitCode::Success)
}
