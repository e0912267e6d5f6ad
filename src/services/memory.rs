// src/services/memory.rs
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::core::entity::{Entity, EntityKind, FieldPatch};
use crate::core::publish::Assistant;
use crate::services::interface::{EntityStore, StoreError};

/// A request the store has seen, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Fetch { kind: EntityKind, id: String },
    Update { kind: EntityKind, id: String, patch: FieldPatch },
    List { kind: EntityKind },
    Delete { kind: EntityKind, id: String },
    ListAssistants,
}

/// Backend work that lands after a number of reads.
struct Provision {
    reads_left: u32,
    fields: FieldPatch,
}

#[derive(Default)]
struct Inner {
    entities: HashMap<(EntityKind, String), Value>,
    provisions: HashMap<(EntityKind, String), Provision>,
    assistants: Vec<Assistant>,
    calls: Vec<StoreCall>,
    failing_updates: u32,
    failing_fetches: u32,
}

/// In-process stand-in for the platform backend.
///
/// Updates are applied as merge patches. Asynchronous provisioning is
/// simulated with `provision_after`, and failures can be injected per call.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<E: Entity>(&self, entity: &E) -> Result<(), serde_json::Error> {
        let doc = serde_json::to_value(entity)?;
        self.inner
            .lock()
            .entities
            .insert((E::KIND, entity.id().to_string()), doc);
        Ok(())
    }

    pub fn get<E: Entity>(&self, id: &str) -> Option<E> {
        let inner = self.inner.lock();
        let doc = inner.entities.get(&(E::KIND, id.to_string()))?;
        serde_json::from_value(doc.clone()).ok()
    }

    /// The `reads`-th fetch of the entity from now on sees `fields` set.
    pub fn provision_after(&self, kind: EntityKind, id: &str, reads: u32, fields: FieldPatch) {
        self.inner.lock().provisions.insert(
            (kind, id.to_string()),
            Provision {
                reads_left: reads.max(1),
                fields,
            },
        );
    }

    pub fn add_assistant(&self, assistant: Assistant) {
        self.inner.lock().assistants.push(assistant);
    }

    pub fn fail_next_updates(&self, count: u32) {
        self.inner.lock().failing_updates = count;
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.inner.lock().failing_fetches = count;
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().calls.clone()
    }

    /// Every update received, as `(id, patch)`.
    pub fn updates(&self) -> Vec<(String, FieldPatch)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::Update { id, patch, .. } => Some((id.clone(), patch.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn fetches(&self, id: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, StoreCall::Fetch { id: fetched, .. } if fetched == id))
            .count()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.calls.push(StoreCall::Fetch {
            kind,
            id: id.to_string(),
        });

        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(StoreError::Unavailable(format!(
                "{} '{}' temporarily unavailable",
                kind, id
            )));
        }

        let key = (kind, id.to_string());
        let landed = match inner.provisions.get_mut(&key) {
            Some(provision) => {
                provision.reads_left -= 1;
                provision.reads_left == 0
            }
            None => false,
        };
        if landed {
            if let (Some(provision), Some(Value::Object(doc))) =
                (inner.provisions.remove(&key), inner.entities.get_mut(&key))
            {
                debug!("Provisioning landed for {} '{}'", kind, id);
                doc.extend(provision.fields);
            }
        }

        inner
            .entities
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &FieldPatch,
    ) -> Result<Value, StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.calls.push(StoreCall::Update {
            kind,
            id: id.to_string(),
            patch: patch.clone(),
        });

        if inner.failing_updates > 0 {
            inner.failing_updates -= 1;
            return Err(StoreError::Http {
                status: 500,
                message: "injected update failure".to_string(),
            });
        }

        let doc = inner
            .entities
            .get_mut(&(kind, id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        json_patch::merge(doc, &Value::Object(patch.clone()));
        Ok(doc.clone())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::List { kind });

        let mut found: Vec<(&String, &Value)> = inner
            .entities
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), doc)| (id, doc))
            .collect();
        found.sort_by(|a, b| a.0.cmp(b.0));
        Ok(found.into_iter().map(|(_, doc)| doc.clone()).collect())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.calls.push(StoreCall::Delete {
            kind,
            id: id.to_string(),
        });

        let key = (kind, id.to_string());
        inner.provisions.remove(&key);
        match inner.entities.remove(&key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            }),
        }
    }

    async fn list_assistants(&self) -> Result<Vec<Assistant>, StoreError> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::ListAssistants);
        Ok(inner.assistants.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::{Agent, OAuthApp};
    use crate::core::providers::OAuthProvider;
    use serde_json::json;

    #[tokio::test]
    async fn test_provisioning_lands_on_nth_read() {
        let store = MemoryStore::new();
        store
            .insert(&Agent {
                id: "agent-42".into(),
                ..Default::default()
            })
            .unwrap();
        store.provision_after(
            EntityKind::Agent,
            "agent-42",
            2,
            json!({"aliasAssigned": true}).as_object().cloned().unwrap(),
        );

        let first = store.fetch(EntityKind::Agent, "agent-42").await.unwrap();
        assert_eq!(first["aliasAssigned"], false);
        let second = store.fetch(EntityKind::Agent, "agent-42").await.unwrap();
        assert_eq!(second["aliasAssigned"], true);
        assert_eq!(store.fetches("agent-42"), 2);
    }

    #[tokio::test]
    async fn test_list_and_delete_by_kind() {
        let store = MemoryStore::new();
        for id in ["agent-b", "agent-a"] {
            store
                .insert(&Agent {
                    id: id.into(),
                    ..Default::default()
                })
                .unwrap();
        }
        store
            .insert(&OAuthApp {
                id: "oa-1".into(),
                provider: OAuthProvider::Slack,
                ref_name: "slack".into(),
                ref_name_assigned: false,
                client_id: "client".into(),
                client_secret: None,
                tenant_id: None,
                app_id: None,
                integration: None,
                extra: Default::default(),
            })
            .unwrap();

        let agents = store.list(EntityKind::Agent).await.unwrap();
        let ids: Vec<&str> = agents.iter().filter_map(|a| a["id"].as_str()).collect();
        assert_eq!(ids, vec!["agent-a", "agent-b"]);

        store.delete(EntityKind::OAuthApp, "oa-1").await.unwrap();
        assert!(store.list(EntityKind::OAuthApp).await.unwrap().is_empty());
        let err = store.delete(EntityKind::OAuthApp, "oa-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.list(EntityKind::Agent).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_entity() {
        let store = MemoryStore::new();
        let err = store
            .update(EntityKind::OAuthApp, "nope", &FieldPatch::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.updates().len(), 1);
    }
}
