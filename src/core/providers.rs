// src/core/providers.rs
//
// Built-in OAuth providers and knowledge-source variants. Each enum owns a
// single handler table so adding a variant is a compile error until every
// capability is filled in.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::entity::OAuthApp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    GitHub,
    Google,
    Microsoft365,
    Slack,
    Notion,
    HubSpot,
    Custom,
}

pub struct ProviderSpec {
    pub display_name: &'static str,
    /// Default ref name the platform assigns to the built-in app.
    pub ref_name: &'static str,
    /// Parameters beyond client id/secret the provider needs.
    pub extra_params: &'static [&'static str],
}

/// Endpoints the platform exposes for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthLinks {
    pub authorize_url: String,
    pub redirect_url: String,
    pub refresh_url: String,
}

impl OAuthProvider {
    pub const ALL: [OAuthProvider; 7] = [
        OAuthProvider::GitHub,
        OAuthProvider::Google,
        OAuthProvider::Microsoft365,
        OAuthProvider::Slack,
        OAuthProvider::Notion,
        OAuthProvider::HubSpot,
        OAuthProvider::Custom,
    ];

    pub fn spec(self) -> ProviderSpec {
        match self {
            OAuthProvider::GitHub => ProviderSpec {
                display_name: "GitHub",
                ref_name: "github",
                extra_params: &[],
            },
            OAuthProvider::Google => ProviderSpec {
                display_name: "Google",
                ref_name: "google",
                extra_params: &[],
            },
            OAuthProvider::Microsoft365 => ProviderSpec {
                display_name: "Microsoft 365",
                ref_name: "microsoft365",
                extra_params: &["tenantID"],
            },
            OAuthProvider::Slack => ProviderSpec {
                display_name: "Slack",
                ref_name: "slack",
                extra_params: &[],
            },
            OAuthProvider::Notion => ProviderSpec {
                display_name: "Notion",
                ref_name: "notion",
                extra_params: &[],
            },
            OAuthProvider::HubSpot => ProviderSpec {
                display_name: "HubSpot",
                ref_name: "hubspot",
                extra_params: &["appID"],
            },
            OAuthProvider::Custom => ProviderSpec {
                display_name: "Custom",
                ref_name: "",
                extra_params: &["authURL", "tokenURL", "integration"],
            },
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            OAuthProvider::GitHub => "github",
            OAuthProvider::Google => "google",
            OAuthProvider::Microsoft365 => "microsoft365",
            OAuthProvider::Slack => "slack",
            OAuthProvider::Notion => "notion",
            OAuthProvider::HubSpot => "hubspot",
            OAuthProvider::Custom => "custom",
        }
    }

    pub fn links(self, api_base: &str) -> OAuthLinks {
        let base = api_base.trim_end_matches('/');
        let slug = self.slug();
        OAuthLinks {
            authorize_url: format!("{}/app/oauth/authorize/{}", base, slug),
            redirect_url: format!("{}/app/oauth/callback/{}", base, slug),
            refresh_url: format!("{}/app/oauth/refresh/{}", base, slug),
        }
    }
}

/// A provider as the console lists it, with the app registered for it.
#[derive(Debug, Clone)]
pub struct OAuthAppDetail {
    pub provider: OAuthProvider,
    pub app: Option<OAuthApp>,
}

/// Every built-in provider paired with the registered app of its type,
/// followed by each custom app.
pub fn combined_oauth_app_info(apps: &[OAuthApp]) -> Vec<OAuthAppDetail> {
    let builtin = OAuthProvider::ALL
        .into_iter()
        .filter(|p| *p != OAuthProvider::Custom)
        .map(|provider| OAuthAppDetail {
            provider,
            app: apps.iter().find(|a| a.provider == provider).cloned(),
        });
    let custom = apps
        .iter()
        .filter(|a| a.provider == OAuthProvider::Custom)
        .map(|app| OAuthAppDetail {
            provider: OAuthProvider::Custom,
            app: Some(app.clone()),
        });
    builtin.chain(custom).collect()
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.spec().display_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnowledgeSourceType {
    OneDrive,
    Notion,
    Website,
}

impl KnowledgeSourceType {
    /// Tool the agent needs attached to ingest this source.
    pub fn tool_ref(self) -> &'static str {
        match self {
            KnowledgeSourceType::OneDrive => "onedrive-data-source",
            KnowledgeSourceType::Notion => "notion-data-source",
            KnowledgeSourceType::Website => "website-data-source",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            KnowledgeSourceType::OneDrive => "OneDrive",
            KnowledgeSourceType::Notion => "Notion",
            KnowledgeSourceType::Website => "Website",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeSourceStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneDriveConfig {
    #[serde(default)]
    pub shared_links: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotionConfig {
    #[serde(default)]
    pub pages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebsiteCrawlingConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkState {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "isFolder")]
    pub is_folder: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OneDriveState {
    #[serde(default)]
    pub links: std::collections::HashMap<String, LinkState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetails {
    #[serde(default)]
    pub onedrive_state: Option<OneDriveState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "agentID", default)]
    pub agent_id: String,
    pub state: KnowledgeSourceStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub sync_details: Option<SyncDetails>,
    #[serde(default)]
    pub onedrive_config: Option<OneDriveConfig>,
    #[serde(default)]
    pub notion_config: Option<NotionConfig>,
    #[serde(default)]
    pub website_crawling_config: Option<WebsiteCrawlingConfig>,
}

impl KnowledgeSource {
    /// Sources without a Notion or OneDrive config are website crawls.
    pub fn source_type(&self) -> KnowledgeSourceType {
        if self.notion_config.is_some() {
            KnowledgeSourceType::Notion
        } else if self.onedrive_config.is_some() {
            KnowledgeSourceType::OneDrive
        } else {
            KnowledgeSourceType::Website
        }
    }

    pub fn display_name(&self) -> String {
        match self.source_type() {
            KnowledgeSourceType::Notion => "Notion".to_string(),
            KnowledgeSourceType::OneDrive => {
                let first_link = self
                    .onedrive_config
                    .as_ref()
                    .and_then(|c| c.shared_links.first());
                let links = self
                    .sync_details
                    .as_ref()
                    .and_then(|d| d.onedrive_state.as_ref())
                    .map(|s| &s.links);
                first_link
                    .zip(links)
                    .and_then(|(link, links)| links.get(link))
                    .and_then(|state| state.name.clone())
                    .unwrap_or_else(|| "OneDrive".to_string())
            }
            KnowledgeSourceType::Website => self
                .website_crawling_config
                .as_ref()
                .and_then(|c| c.urls.first().cloned())
                .unwrap_or_else(|| "Website".to_string()),
        }
    }
}
