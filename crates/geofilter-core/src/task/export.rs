//! Export task: write datasets under their current subsets

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::{Task, TaskContext, TaskKind, TaskOutput};
use crate::dataset::{Crs, DatasetHandle, DatasetId, Feature};
use crate::error::{FilterError, Result};
use crate::geometry::transform;
use crate::host::{DatasetRegistry, ExportLayer, ExportOptions, ExportWriter, FeatureSource};

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub datasets: Vec<DatasetId>,
    /// Subset to export per dataset; missing means every feature
    pub subsets: BTreeMap<DatasetId, String>,
    /// Directory in batch mode, file otherwise
    pub output: PathBuf,
    pub format: String,
    pub target_crs: Option<Crs>,
    pub style: bool,
    /// One file per dataset instead of a single merged file
    pub batch: bool,
    /// Bundle the written files into this archive
    pub archive: Option<PathBuf>,
}

impl ExportRequest {
    pub fn new(datasets: Vec<DatasetId>, output: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            datasets,
            subsets: BTreeMap::new(),
            output: output.into(),
            format: format.into(),
            target_crs: None,
            style: false,
            batch: false,
            archive: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportSummary {
    pub files: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    /// Features written per dataset
    pub features: BTreeMap<DatasetId, usize>,
    pub warnings: Vec<String>,
}

/// File extension for a writer format name
pub fn extension(format: &str) -> String {
    match format.to_ascii_lowercase().as_str() {
        "geojson" | "json" => "geojson".to_string(),
        "geojsonseq" | "geojsonl" | "ndjson" => "geojsonl".to_string(),
        other => other.to_string(),
    }
}

fn reproject(features: Vec<Feature>, from: &Crs, to: &Crs) -> Result<Vec<Feature>> {
    if from == to {
        return Ok(features);
    }
    features
        .into_iter()
        .map(|mut feature| {
            if let Some(geometry) = &feature.geometry {
                feature.geometry = Some(transform::transform(geometry, from, to)?);
            }
            Ok(feature)
        })
        .collect()
}

pub struct ExportTask {
    request: ExportRequest,
    registry: Arc<dyn DatasetRegistry>,
    features: Arc<dyn FeatureSource>,
    writer: Arc<dyn ExportWriter>,
}

impl ExportTask {
    pub fn new(
        request: ExportRequest,
        registry: Arc<dyn DatasetRegistry>,
        features: Arc<dyn FeatureSource>,
        writer: Arc<dyn ExportWriter>,
    ) -> Self {
        Self {
            request,
            registry,
            features,
            writer,
        }
    }

    fn extract(&self, dataset: &DatasetHandle, target: &Crs) -> Result<ExportLayer> {
        let subset = self.request.subsets.get(&dataset.id).map(String::as_str);
        let features = self.features.features(dataset, subset)?;
        Ok(ExportLayer {
            dataset: dataset.id.clone(),
            name: dataset.name.clone(),
            crs: target.clone(),
            features: reproject(features, &dataset.crs, target)?,
        })
    }

    fn write(&self, layer: &ExportLayer, dataset: &DatasetHandle, path: &Path, summary: &mut ExportSummary) -> Result<()> {
        let options = ExportOptions {
            format: self.request.format.clone(),
            target_crs: self.request.target_crs.clone(),
        };
        let written = self.writer.write_layer(layer, &options, path)?;
        summary.files.push(written.clone());
        if self.request.style {
            match self.writer.write_style(dataset, &written)? {
                Some(style) => summary.files.push(style),
                None => summary.warnings.push(format!("no style available for {}", dataset.id)),
            }
        }
        Ok(())
    }

    fn export(&self, ctx: &TaskContext) -> Result<ExportSummary> {
        if self.request.datasets.is_empty() {
            return Err(FilterError::invalid_value("export", "no datasets"));
        }
        let datasets = self
            .request
            .datasets
            .iter()
            .map(|id| {
                self.registry
                    .resolve(id)
                    .ok_or_else(|| FilterError::DatasetUnavailable(id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut summary = ExportSummary::default();
        let total = datasets.len() as u32;

        if self.request.batch {
            std::fs::create_dir_all(&self.request.output)?;
            for (n, dataset) in datasets.iter().enumerate() {
                ctx.check_canceled()?;
                let target = self.request.target_crs.clone().unwrap_or_else(|| dataset.crs.clone());
                let layer = self.extract(dataset, &target)?;
                summary.features.insert(dataset.id.clone(), layer.features.len());
                let path = self.request.output.join(format!(
                    "{}.{}",
                    dataset.id.slug(),
                    extension(&self.request.format)
                ));
                self.write(&layer, dataset, &path, &mut summary)?;
                ctx.set_progress((n as u32 + 1) * 80 / total);
            }
        } else {
            let target = self
                .request
                .target_crs
                .clone()
                .unwrap_or_else(|| datasets[0].crs.clone());
            let mut merged = Vec::new();
            for dataset in &datasets {
                ctx.check_canceled()?;
                let layer = self.extract(dataset, &target)?;
                summary.features.insert(dataset.id.clone(), layer.features.len());
                merged.extend(layer.features);
            }
            let first = &datasets[0];
            let layer = ExportLayer {
                dataset: first.id.clone(),
                name: self
                    .request
                    .output
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| first.name.clone()),
                crs: target,
                features: merged,
            };
            ctx.check_canceled()?;
            self.write(&layer, first, &self.request.output, &mut summary)?;
        }

        if let Some(archive) = &self.request.archive {
            ctx.check_canceled()?;
            summary.archive = Some(self.writer.archive(&summary.files, archive)?);
        }
        Ok(summary)
    }
}

impl Task for ExportTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Export
    }

    fn describe(&self) -> String {
        format!(
            "export {} dataset(s) to {}",
            self.request.datasets.len(),
            self.request.output.display()
        )
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput> {
        self.export(ctx)
            .map_err(|e| match e {
                FilterError::Io(io) => FilterError::Export {
                    target: self.request.output.clone(),
                    reason: io.to_string(),
                },
                other => other,
            })
            .map(TaskOutput::Export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension() {
        assert_eq!(extension("GeoJSON"), "geojson");
        assert_eq!(extension("geojsonseq"), "geojsonl");
        assert_eq!(extension("gpkg"), "gpkg");
    }
}
