// src/services/otto.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::core::entity::{EntityKind, FieldPatch, UpdateRoute};
use crate::core::providers::KnowledgeSource;
use crate::core::publish::Assistant;
use crate::services::config::OttoConfig;
use crate::services::interface::{EntityStore, StoreError};

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ItemList<T> {
    #[serde(default)]
    items: Option<Vec<T>>,
}

/// HTTP client for the Otto platform API.
///
/// Built once from config and shared by every session that needs it.
#[derive(Clone)]
pub struct OttoClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl OttoClient {
    pub fn new(config: &OttoConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.api.timeout_secs))
            .build()
            .context("Failed to build HTTP client for the Otto API")?;

        Ok(Self {
            http,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            token: config.token(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn entity_url(&self, kind: EntityKind, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            kind.collection(),
            urlencoding::encode(id)
        )
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn ensure_success(
        res: Response,
        kind: EntityKind,
        id: &str,
    ) -> Result<Response, StoreError> {
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.to_string()
            } else {
                body
            };
            return Err(StoreError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(res)
    }

    async fn read_json<T: DeserializeOwned>(
        res: Response,
        kind: EntityKind,
        id: &str,
    ) -> Result<T, StoreError> {
        let res = Self::ensure_success(res, kind, id).await?;
        Ok(res.json().await?)
    }

    async fn get_items<T: DeserializeOwned>(
        &self,
        url: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<Vec<T>, StoreError> {
        let res = self.authorized(self.http.get(url)).send().await?;
        let list: ItemList<T> = Self::read_json(res, kind, id).await?;
        Ok(list.items.unwrap_or_default())
    }

    pub async fn list_knowledge_sources(
        &self,
        agent_id: &str,
    ) -> Result<Vec<KnowledgeSource>, StoreError> {
        let url = format!(
            "{}/knowledge-sources",
            self.entity_url(EntityKind::Agent, agent_id)
        );
        self.get_items(&url, EntityKind::Agent, agent_id).await
    }

    /// `Ok(false)` when the server cannot be reached at all.
    pub async fn check_connection(&self) -> Result<bool> {
        match self.list_assistants().await {
            Ok(_) => Ok(true),
            Err(StoreError::Transport(e)) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EntityStore for OttoClient {
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, StoreError> {
        let url = self.entity_url(kind, id);
        debug!("GET {}", url);
        let res = self.authorized(self.http.get(&url)).send().await?;
        Self::read_json(res, kind, id).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<Value, StoreError> {
        let url = self.entity_url(kind, id);

        match kind.update_route() {
            UpdateRoute::Replace => {
                // The API replaces on PUT, so send the current manifest with
                // the patch folded in.
                let mut manifest = self.fetch(kind, id).await?;
                json_patch::merge(&mut manifest, &Value::Object(patch.clone()));
                debug!("PUT {}", url);
                let res = self
                    .authorized(self.http.put(&url))
                    .json(&manifest)
                    .send()
                    .await?;
                Self::read_json(res, kind, id).await
            }
            UpdateRoute::Configure => {
                let config = patch.get("config").cloned().unwrap_or_else(|| json!({}));
                let ignored: Vec<&String> = patch.keys().filter(|k| *k != "config").collect();
                if !ignored.is_empty() {
                    debug!("{} '{}' only accepts config, ignoring {:?}", kind, id, ignored);
                }
                let configure_url = format!("{}/configure", url);
                debug!("POST {}", configure_url);
                let res = self
                    .authorized(self.http.post(&configure_url))
                    .json(&config)
                    .send()
                    .await?;
                Self::ensure_success(res, kind, id).await?;
                self.fetch(kind, id).await
            }
        }
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        let url = format!("{}/{}", self.base_url, kind.collection());
        debug!("GET {}", url);
        self.get_items(&url, kind, kind.collection()).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let url = self.entity_url(kind, id);
        debug!("DELETE {}", url);
        let res = self.authorized(self.http.delete(&url)).send().await?;
        Self::ensure_success(res, kind, id).await?;
        Ok(())
    }

    async fn list_assistants(&self) -> Result<Vec<Assistant>, StoreError> {
        let url = format!("{}/assistants", self.base_url);
        debug!("GET {}", url);
        self.get_items(&url, EntityKind::Agent, "assistants").await
    }
}
