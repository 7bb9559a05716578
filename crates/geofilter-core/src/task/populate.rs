//! Populate-list task: distinct values of one field

use std::cmp::Ordering;
use std::sync::Arc;

use super::{Task, TaskContext, TaskKind, TaskOutput};
use crate::dataset::{AttributeValue, DatasetId};
use crate::error::{FilterError, Result};
use crate::host::{DatasetRegistry, FeatureSource};

#[derive(Debug, Clone, PartialEq)]
pub struct PopulateRequest {
    pub dataset: DatasetId,
    pub field: String,
    /// Restrict to this subset (usually the dataset's current one)
    pub subset: Option<String>,
    pub limit: usize,
}

fn rank(value: &AttributeValue) -> u8 {
    match value {
        AttributeValue::Null => 0,
        AttributeValue::Bool(_) => 1,
        AttributeValue::Integer(_) | AttributeValue::Real(_) => 2,
        AttributeValue::Text(_) => 3,
    }
}

/// Total order for listing: nulls, booleans, numbers, then text
pub fn compare_values(a: &AttributeValue, b: &AttributeValue) -> Ordering {
    match (a, b) {
        (AttributeValue::Bool(x), AttributeValue::Bool(y)) => x.cmp(y),
        (AttributeValue::Text(x), AttributeValue::Text(y)) => x.cmp(y),
        _ if rank(a) == 2 && rank(b) == 2 => {
            let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

pub struct PopulateListTask {
    request: PopulateRequest,
    registry: Arc<dyn DatasetRegistry>,
    features: Arc<dyn FeatureSource>,
    check_interval: usize,
}

impl PopulateListTask {
    pub fn new(
        request: PopulateRequest,
        registry: Arc<dyn DatasetRegistry>,
        features: Arc<dyn FeatureSource>,
        check_interval: usize,
    ) -> Self {
        Self {
            request,
            registry,
            features,
            check_interval: check_interval.max(1),
        }
    }

    fn collect(&self, ctx: &TaskContext) -> Result<Vec<AttributeValue>> {
        let dataset = self
            .registry
            .resolve(&self.request.dataset)
            .ok_or_else(|| FilterError::DatasetUnavailable(self.request.dataset.clone()))?;
        if !dataset.has_field(&self.request.field) {
            return Err(FilterError::invalid_expression(format!(
                "unknown field in {}: {}",
                dataset.id, self.request.field
            )));
        }

        let subset = self.request.subset.as_deref().filter(|s| !s.trim().is_empty());
        let features = self.features.features(&dataset, subset)?;
        let mut values = Vec::new();
        for (n, feature) in features.iter().enumerate() {
            if n % self.check_interval == 0 {
                ctx.check_canceled()?;
            }
            let value = feature
                .attribute(&self.request.field)
                .cloned()
                .or_else(|| {
                    // the key column is not an attribute for every host
                    dataset
                        .primary_key
                        .as_deref()
                        .filter(|pk| pk.eq_ignore_ascii_case(&self.request.field))
                        .map(|_| AttributeValue::Integer(feature.id))
                })
                .unwrap_or(AttributeValue::Null);
            values.push(value);
        }

        values.sort_by(compare_values);
        values.dedup_by(|a, b| compare_values(a, b) == Ordering::Equal);
        values.truncate(self.request.limit);
        Ok(values)
    }
}

impl Task for PopulateListTask {
    fn kind(&self) -> TaskKind {
        TaskKind::PopulateList
    }

    fn describe(&self) -> String {
        format!("values of {}.{}", self.request.dataset, self.request.field)
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput> {
        self.collect(ctx).map(TaskOutput::Values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_order() {
        let mut values = vec![
            AttributeValue::Text("b".into()),
            AttributeValue::Real(2.5),
            AttributeValue::Null,
            AttributeValue::Integer(2),
            AttributeValue::Text("a".into()),
            AttributeValue::Integer(10),
        ];
        values.sort_by(compare_values);
        assert_eq!(
            values,
            vec![
                AttributeValue::Null,
                AttributeValue::Integer(2),
                AttributeValue::Real(2.5),
                AttributeValue::Integer(10),
                AttributeValue::Text("a".into()),
                AttributeValue::Text("b".into()),
            ]
        );
    }
}
