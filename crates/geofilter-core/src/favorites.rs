//! Named filter requests saved for reuse

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetId;
use crate::error::{FilterError, Result};
use crate::request::FilterRequest;
use crate::store::RecordStore;

pub const FAVORITES_PREFIX: &str = "favorites/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub request: FilterRequest,
    pub created: DateTime<Utc>,
}

impl Favorite {
    pub fn new(name: impl Into<String>, request: FilterRequest) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.contains('/') {
            return Err(FilterError::invalid_value("favorite name", name));
        }
        Ok(Self {
            name: trimmed.to_string(),
            description: None,
            request,
            created: Utc::now(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The saved request, optionally retargeted
    pub fn request_for(&self, targets: Option<Vec<DatasetId>>) -> FilterRequest {
        let mut request = self.request.clone();
        if let Some(targets) = targets.filter(|t| !t.is_empty()) {
            request.targets = targets;
        }
        if request.description.is_none() {
            request.description = Some(format!("favorite: {}", self.name));
        }
        request
    }

    fn key(name: &str) -> String {
        format!("{}{}", FAVORITES_PREFIX, name.trim())
    }
}

/// Save (or overwrite) a favorite
pub fn save(store: &dyn RecordStore, favorite: &Favorite) -> Result<()> {
    store.put(&Favorite::key(&favorite.name), &serde_json::to_value(favorite)?)
}

pub fn load(store: &dyn RecordStore, name: &str) -> Result<Option<Favorite>> {
    store
        .get(&Favorite::key(name))?
        .map(|value| serde_json::from_value(value).map_err(FilterError::from))
        .transpose()
}

/// Every favorite, sorted by name; unreadable records are skipped
pub fn list(store: &dyn RecordStore) -> Result<Vec<Favorite>> {
    Ok(store
        .list(FAVORITES_PREFIX)?
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(favorite) => Some(favorite),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "skipping unreadable favorite");
                None
            }
        })
        .collect())
}
