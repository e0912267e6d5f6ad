// src/core/models.rs
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::core::entity::{Entity, EntityKind, FieldPatch};
use crate::services::interface::{list_entities, update_entity, EntityStore, StoreError};

/// What a model is used for. Assigned by the admin once a provider has
/// back-populated its models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelUsage {
    #[serde(rename = "llm")]
    Llm,
    #[serde(rename = "text-embedding")]
    TextEmbedding,
    #[serde(rename = "image-generation")]
    ImageGeneration,
    #[serde(rename = "vision")]
    Vision,
    #[serde(rename = "other")]
    Other,
    #[default]
    #[serde(rename = "")]
    #[serde(other)]
    Unknown,
}

impl ModelUsage {
    /// Usages an admin can pick.
    pub const SELECTABLE: [ModelUsage; 5] = [
        ModelUsage::Llm,
        ModelUsage::TextEmbedding,
        ModelUsage::ImageGeneration,
        ModelUsage::Vision,
        ModelUsage::Other,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            ModelUsage::Llm => "llm",
            ModelUsage::TextEmbedding => "text-embedding",
            ModelUsage::ImageGeneration => "image-generation",
            ModelUsage::Vision => "vision",
            ModelUsage::Other => "other",
            ModelUsage::Unknown => "",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelUsage::Llm => "Language Model",
            ModelUsage::TextEmbedding => "Text Embedding",
            ModelUsage::ImageGeneration => "Image Generation",
            ModelUsage::Vision => "Vision",
            ModelUsage::Other => "Other",
            ModelUsage::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ModelUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

impl FromStr for ModelUsage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SELECTABLE
            .into_iter()
            .find(|u| u.wire_name() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::SELECTABLE.iter().map(|u| u.wire_name()).collect();
                format!("unknown model usage '{}', expected one of: {}", s, valid.join(", "))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub target_model: String,
    /// Id of the provider that populated this model.
    #[serde(default)]
    pub model_provider: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub usage: ModelUsage,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Model {
    const KIND: EntityKind = EntityKind::Model;
    const DERIVED_FIELDS: &'static [&'static str] = &[];

    fn id(&self) -> &str {
        &self.id
    }

    fn is_provisioned(&self) -> bool {
        true
    }

    fn adopt_derived(&mut self, _server: &Self) {}

    fn provisioning_token(&self, _patch: &FieldPatch) -> Option<String> {
        None
    }
}

/// Models back-populated by `provider_id`, ordered by name.
pub async fn provider_models(
    store: &dyn EntityStore,
    provider_id: &str,
) -> Result<Vec<Model>, StoreError> {
    let mut models: Vec<Model> = list_entities::<Model>(store)
        .await?
        .into_iter()
        .filter(|m| m.model_provider == provider_id)
        .collect();
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

pub async fn set_usage(
    store: &dyn EntityStore,
    model_id: &str,
    usage: ModelUsage,
) -> Result<Model, StoreError> {
    let mut patch = FieldPatch::new();
    patch.insert("usage".to_string(), json!(usage));
    update_entity(store, model_id, &patch).await
}
