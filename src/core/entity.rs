// src/core/entity.rs
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::providers::OAuthProvider;

/// Partial field update, keyed by the entity's wire (camelCase) field names.
pub type FieldPatch = Map<String, Value>;

/// Closed set of entity kinds the console edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Agent,
    ModelProvider,
    Model,
    OAuthApp,
}

/// How the backend accepts writes for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRoute {
    /// `PUT {collection}/{id}` with the full manifest.
    Replace,
    /// `POST {collection}/{id}/configure` with the `config` object only.
    Configure,
}

pub struct KindSpec {
    pub collection: &'static str,
    pub label: &'static str,
    pub update: UpdateRoute,
}

const AGENT_SPEC: KindSpec = KindSpec {
    collection: "agents",
    label: "agent",
    update: UpdateRoute::Replace,
};

const MODEL_PROVIDER_SPEC: KindSpec = KindSpec {
    collection: "model-providers",
    label: "model provider",
    update: UpdateRoute::Configure,
};

const MODEL_SPEC: KindSpec = KindSpec {
    collection: "models",
    label: "model",
    update: UpdateRoute::Replace,
};

const OAUTH_APP_SPEC: KindSpec = KindSpec {
    collection: "oauth-apps",
    label: "oauth app",
    update: UpdateRoute::Replace,
};

impl EntityKind {
    pub fn spec(self) -> &'static KindSpec {
        match self {
            EntityKind::Agent => &AGENT_SPEC,
            EntityKind::ModelProvider => &MODEL_PROVIDER_SPEC,
            EntityKind::Model => &MODEL_SPEC,
            EntityKind::OAuthApp => &OAUTH_APP_SPEC,
        }
    }

    pub fn collection(self) -> &'static str {
        self.spec().collection
    }

    pub fn update_route(self) -> UpdateRoute {
        self.spec().update
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec().label)
    }
}

/// A backend-managed record that can be edited through a session.
///
/// Implementors declare which fields only the backend computes
/// (`DERIVED_FIELDS`) and which flag marks asynchronous provisioning as
/// finished. Derived fields are always trusted from server reads and are
/// never accepted from local edits.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Wire name of the stable identifier. Never editable.
    const ID_FIELD: &'static str = "id";

    /// Wire names of the server-computed fields.
    const DERIVED_FIELDS: &'static [&'static str];

    fn id(&self) -> &str;

    /// Completion flag the watcher waits for.
    fn is_provisioned(&self) -> bool;

    /// Copy every derived field from a server read into `self`.
    fn adopt_derived(&mut self, server: &Self);

    /// Token to watch after committing `patch`, when the commit kicks off
    /// backend provisioning. `None` for ordinary edits.
    fn provisioning_token(&self, patch: &FieldPatch) -> Option<String>;
}

/// Apply `patch` to a copy of `entity` using JSON merge-patch rules.
pub fn apply_patch<E: Entity>(entity: &E, patch: &FieldPatch) -> Result<E, serde_json::Error> {
    let mut doc = serde_json::to_value(entity)?;
    json_patch::merge(&mut doc, &Value::Object(patch.clone()));
    serde_json::from_value(doc)
}

/// Fold `change` into `pending`. Later keys win; nested objects merge
/// key-wise. Unlike merge-patch application, explicit nulls are kept so the
/// backend still receives them.
pub fn coalesce(pending: &mut FieldPatch, change: FieldPatch) {
    for (key, value) in change {
        match (pending.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => coalesce(existing, nested),
            (_, value) => {
                pending.insert(key, value);
            }
        }
    }
}

fn patch_has_text(patch: &FieldPatch, key: &str) -> bool {
    patch
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub alias_assigned: bool,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub default_thread_tools: Vec<String>,
    #[serde(default)]
    pub available_thread_tools: Vec<String>,
    /// Fields the console does not model, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for Agent {
    const KIND: EntityKind = EntityKind::Agent;
    const DERIVED_FIELDS: &'static [&'static str] = &["aliasAssigned"];

    fn id(&self) -> &str {
        &self.id
    }

    fn is_provisioned(&self) -> bool {
        self.alias_assigned
    }

    fn adopt_derived(&mut self, server: &Self) {
        self.alias_assigned = server.alias_assigned;
    }

    fn provisioning_token(&self, patch: &FieldPatch) -> Option<String> {
        patch_has_text(patch, "alias").then(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProvider {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub models_back_populated: bool,
    #[serde(default)]
    pub required_configuration_parameters: Vec<String>,
    /// Credential parameters; only ever sent, the backend never echoes them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelProvider {
    /// Required parameters not present in `config`.
    pub fn missing_parameters<'a>(&'a self, config: &BTreeMap<String, String>) -> Vec<&'a str> {
        self.required_configuration_parameters
            .iter()
            .filter(|p| config.get(p.as_str()).map_or(true, |v| v.is_empty()))
            .map(|p| p.as_str())
            .collect()
    }
}

impl Entity for ModelProvider {
    const KIND: EntityKind = EntityKind::ModelProvider;
    const DERIVED_FIELDS: &'static [&'static str] = &["configured", "modelsBackPopulated"];

    fn id(&self) -> &str {
        &self.id
    }

    fn is_provisioned(&self) -> bool {
        self.models_back_populated
    }

    fn adopt_derived(&mut self, server: &Self) {
        self.configured = server.configured;
        self.models_back_populated = server.models_back_populated;
    }

    fn provisioning_token(&self, patch: &FieldPatch) -> Option<String> {
        let submitted = patch
            .get("config")
            .and_then(|v| v.as_object())
            .map(|c| !c.is_empty())
            .unwrap_or(false);
        submitted.then(|| self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthApp {
    pub id: String,
    #[serde(rename = "type")]
    pub provider: OAuthProvider,
    #[serde(default)]
    pub ref_name: String,
    #[serde(default)]
    pub ref_name_assigned: bool,
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(rename = "tenantID", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(rename = "appID", default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for OAuthApp {
    const KIND: EntityKind = EntityKind::OAuthApp;
    const DERIVED_FIELDS: &'static [&'static str] = &["refNameAssigned"];

    fn id(&self) -> &str {
        &self.id
    }

    fn is_provisioned(&self) -> bool {
        self.ref_name_assigned
    }

    fn adopt_derived(&mut self, server: &Self) {
        self.ref_name_assigned = server.ref_name_assigned;
    }

    fn provisioning_token(&self, patch: &FieldPatch) -> Option<String> {
        patch_has_text(patch, "refName").then(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(v: Value) -> FieldPatch {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_kind_table() {
        assert_eq!(EntityKind::Agent.collection(), "agents");
        assert_eq!(EntityKind::ModelProvider.update_route(), UpdateRoute::Configure);
        assert_eq!(EntityKind::OAuthApp.to_string(), "oauth app");
    }

    #[test]
    fn test_apply_patch_keeps_unknown_fields() {
        let agent: Agent = serde_json::from_value(json!({
            "id": "agent-42",
            "name": "Support",
            "icons": {"light": "a.svg"}
        }))
        .unwrap();

        let next = apply_patch(&agent, &patch(json!({"name": "Helpdesk"}))).unwrap();
        assert_eq!(next.name, "Helpdesk");
        assert_eq!(next.extra["icons"]["light"], "a.svg");
    }

    #[test]
    fn test_apply_patch_rejects_wrong_type() {
        let agent = Agent {
            id: "agent-42".into(),
            ..Default::default()
        };
        assert!(apply_patch(&agent, &patch(json!({"tools": "web"}))).is_err());
    }

    #[test]
    fn test_coalesce_merges_nested_and_keeps_null() {
        let mut pending = patch(json!({"a": 1, "config": {"apiKey": "k"}}));
        coalesce(
            &mut pending,
            patch(json!({"a": 2, "b": null, "config": {"endpoint": "e"}})),
        );
        assert_eq!(
            Value::Object(pending),
            json!({"a": 2, "b": null, "config": {"apiKey": "k", "endpoint": "e"}})
        );
    }

    #[test]
    fn test_provisioning_tokens() {
        let agent = Agent {
            id: "agent-42".into(),
            ..Default::default()
        };
        assert_eq!(
            agent.provisioning_token(&patch(json!({"alias": "acme-bot"}))),
            Some("agent-42".to_string())
        );
        assert_eq!(agent.provisioning_token(&patch(json!({"alias": ""}))), None);
        assert_eq!(agent.provisioning_token(&patch(json!({"name": "x"}))), None);

        let provider = ModelProvider {
            id: "openai".into(),
            ..Default::default()
        };
        assert_eq!(
            provider.provisioning_token(&patch(json!({"config": {"apiKey": "sk"}}))),
            Some("openai".to_string())
        );
        assert_eq!(provider.provisioning_token(&patch(json!({"config": {}}))), None);
    }

    #[test]
    fn test_missing_parameters() {
        let provider = ModelProvider {
            id: "azure".into(),
            required_configuration_parameters: vec!["apiKey".into(), "endpoint".into()],
            ..Default::default()
        };
        let config = BTreeMap::from([("apiKey".to_string(), "sk".to_string())]);
        assert_eq!(provider.missing_parameters(&config), vec!["endpoint"]);
    }
}
