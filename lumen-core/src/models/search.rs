//! Catalog search criteria.

use serde::{Deserialize, Serialize};

use super::metadata::ModelMetadata;
use crate::types::ModelFormat;

/// Either a single format or a list of acceptable formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatFilter {
    One(ModelFormat),
    Any(Vec<ModelFormat>),
}

impl FormatFilter {
    pub fn matches(&self, format: ModelFormat) -> bool {
        match self {
            FormatFilter::One(f) => *f == format,
            FormatFilter::Any(formats) => formats.contains(&format),
        }
    }
}

impl From<ModelFormat> for FormatFilter {
    fn from(format: ModelFormat) -> Self {
        FormatFilter::One(format)
    }
}

impl From<Vec<ModelFormat>> for FormatFilter {
    fn from(formats: Vec<ModelFormat>) -> Self {
        FormatFilter::Any(formats)
    }
}

/// Filters for `search_models`. Every `None` or empty field is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCriteria {
    pub task_type: Option<String>,
    pub format: Option<FormatFilter>,
    pub max_memory_mb: Option<f64>,
    pub min_accuracy: Option<f64>,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    /// Case-insensitive match against name or description.
    pub query: Option<String>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn format(mut self, format: impl Into<FormatFilter>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn min_accuracy(mut self, accuracy: f64) -> Self {
        self.min_accuracy = Some(accuracy);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn matches(&self, model: &ModelMetadata) -> bool {
        if let Some(task) = &self.task_type {
            if !model.supports_task(task) {
                return false;
            }
        }
        if let Some(format) = &self.format {
            if !format.matches(model.format) {
                return false;
            }
        }
        if let Some(max) = self.max_memory_mb {
            if model.expected_memory_mb() > max {
                return false;
            }
        }
        if let Some(min) = self.min_accuracy {
            if model.performance.accuracy < min {
                return false;
            }
        }
        if !self.tags.iter().all(|t| model.tags.contains(t)) {
            return false;
        }
        if !self
            .capabilities
            .iter()
            .all(|c| model.capabilities.iter().any(|mc| &mc.capability_type == c))
        {
            return false;
        }
        if let Some(query) = &self.query {
            let query = query.to_lowercase();
            let hit = model.name.to_lowercase().contains(&query)
                || model.description.to_lowercase().contains(&query);
            if !hit {
                return false;
            }
        }
        true
    }
}
