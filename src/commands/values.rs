//! `geofilter values`

use geofilter_core::dataset::DatasetId;
use geofilter_core::error::{ExitCode, FilterError, Result};
use geofilter_core::orchestrator::Report;

use crate::cli::output::print_json;
use crate::commands::dispatch::CommandContext;

pub fn execute(
    ctx: &CommandContext,
    layer: &str,
    field: &str,
    all: bool,
    limit: Option<usize>,
) -> Result<ExitCode> {
    let mut session = ctx.session()?;
    session
        .orchestrator
        .submit_populate_list(DatasetId::new(layer), field, !all, limit)?;
    let report = session.wait_one();
    session.close();

    let values = match report? {
        Report::Values { result, .. } => result?,
        other => return Err(FilterError::Other(format!("unexpected report {:?}", other))),
    };
    if ctx.json() {
        print_json(&values)?;
    } else {
        for value in &values {
            println!("{}", value);
        }
    }
    Ok(ExitCode::Success)
}
