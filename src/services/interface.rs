// src/services/interface.rs
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::entity::{Entity, EntityKind, FieldPatch};
use crate::core::publish::Assistant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("backend rejected request ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Unavailable(String),
}

/// Backend capabilities an edit session needs.
///
/// Kept at the JSON level so one implementation serves every entity kind
/// and sessions can hold it as `Arc<dyn EntityStore>`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Read one entity. Used for the initial load and every poll tick.
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, StoreError>;

    /// Persist a partial update and return the entity as the backend now
    /// sees it.
    async fn update(&self, kind: EntityKind, id: &str, patch: &FieldPatch)
        -> Result<Value, StoreError>;

    /// Every entity of `kind`.
    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Published aliases and the entities that own them.
    async fn list_assistants(&self) -> Result<Vec<Assistant>, StoreError>;
}

pub async fn fetch_entity<E: Entity>(store: &dyn EntityStore, id: &str) -> Result<E, StoreError> {
    let raw = store.fetch(E::KIND, id).await?;
    Ok(serde_json::from_value(raw)?)
}

pub async fn update_entity<E: Entity>(
    store: &dyn EntityStore,
    id: &str,
    patch: &FieldPatch,
) -> Result<E, StoreError> {
    let raw = store.update(E::KIND, id, patch).await?;
    Ok(serde_json::from_value(raw)?)
}

pub async fn list_entities<E: Entity>(store: &dyn EntityStore) -> Result<Vec<E>, StoreError> {
    store
        .list(E::KIND)
        .await?
        .into_iter()
        .map(|raw| serde_json::from_value(raw).map_err(StoreError::from))
        .collect()
}
