// src/core/publish.rs
use serde::{Deserialize, Serialize};

use crate::core::entity::Agent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantType {
    Agent,
    Workflow,
}

/// Directory entry mapping a published alias to the entity serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assistant {
    /// The alias.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "entityID")]
    pub entity_id: String,
    #[serde(rename = "type")]
    pub kind: AssistantType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishStatus {
    Unpublished,
    /// Alias committed, backend has not assigned it yet.
    Pending { alias: String },
    /// Alias is taken by another agent or workflow.
    Unavailable { alias: String, owner: Assistant },
    Published { alias: String, url: String },
}

/// Whether `publish_status` needs the assistant directory for this agent.
pub fn needs_directory(agent: &Agent) -> bool {
    !agent.alias.is_empty() && !agent.alias_assigned
}

pub fn publish_status(
    agent: &Agent,
    assistants: &[Assistant],
    consumption_url: &str,
) -> PublishStatus {
    if agent.alias.is_empty() {
        return PublishStatus::Unpublished;
    }

    if needs_directory(agent) {
        if let Some(owner) = assistants
            .iter()
            .find(|a| a.id == agent.alias && a.entity_id != agent.id)
        {
            return PublishStatus::Unavailable {
                alias: agent.alias.clone(),
                owner: owner.clone(),
            };
        }
        return PublishStatus::Pending {
            alias: agent.alias.clone(),
        };
    }

    PublishStatus::Published {
        alias: agent.alias.clone(),
        url: format!("{}/{}", consumption_url.trim_end_matches('/'), agent.alias),
    }
}
