//! Pipeline descriptor data structures.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::data::Attribute;

/// A full pipeline descriptor as loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionConfig {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: IOMetadataConfig,
    pub stages: Vec<StageConfig>,
}

/// Declared pipeline inputs and outputs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IOMetadataConfig {
    #[serde(default)]
    pub input: Vec<Attribute>,
    #[serde(default)]
    pub output: Vec<Attribute>,
}

/// Configuration for a single stage in the pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    #[serde(rename = "ref")]
    pub activity_ref: String,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default)]
    pub input: HashMap<String, Value>,
    #[serde(default)]
    pub output: HashMap<String, Value>,
}
