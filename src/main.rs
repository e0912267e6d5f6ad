// src/main.rs
use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use otto_console::core::models::{provider_models, set_usage};
use otto_console::core::publish::{needs_directory, AssistantType};
use otto_console::services::config::{CONFIG_FILE, TOKEN_ENV};
use otto_console::services::interface::{fetch_entity, list_entities};
use otto_console::{
    combined_oauth_app_info, publish_status, Agent, Assistant, EditSession, Entity, EntityKind,
    EntityStore, FieldPatch, MemoryStore, Model, ModelProvider, ModelUsage, OAuthApp,
    OAuthProvider, OttoClient, OttoConfig, Provisioning, PublishStatus, SaveStatus,
    SessionOptions, SessionState,
};

#[derive(Parser)]
#[command(name = "otto-console", author = "Otto Team", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect, edit and publish agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Configure model provider credentials
    ModelProvider {
        #[command(subcommand)]
        action: ModelProviderAction,
    },
    /// List models and assign their usage
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Register OAuth apps
    OauthApp {
        #[command(subcommand)]
        action: OAuthAppAction,
    },
    /// Run the publish flow against an in-memory backend
    Demo,
    /// Show the local configuration
    Whoami {
        /// Test connection to the Otto API
        #[arg(long)]
        check_connection: bool,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Print an agent and its publish status
    Show { id: String },
    /// Publish under an alias and wait until it is assigned
    Publish { id: String, alias: String },
    /// Remove the alias
    Unpublish { id: String },
    /// Edit fields (debounced) and wait for the save
    Edit {
        id: String,
        /// Field assignment, e.g. --set name="Support Bot"
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        assignments: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ModelProviderAction {
    /// Submit credentials and wait for the model list
    Configure {
        id: String,
        #[arg(long = "param", value_name = "KEY=VALUE", required = true)]
        params: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// List models, optionally for one provider
    List {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Set what a model is used for (llm, text-embedding, image-generation, vision, other)
    SetUsage { id: String, usage: String },
}

#[derive(Subcommand)]
enum OAuthAppAction {
    /// Set the ref name and wait until it is assigned
    Register { id: String, ref_name: String },
    /// List built-in providers with the apps registered for them
    List,
    /// Delete a registered app
    Delete {
        id: String,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// List built-in providers and their endpoints
    Providers,
}

/// Parse `key=value` pairs. Values that look like JSON arrays, objects or
/// null are decoded, anything else is taken as a string.
fn parse_assignments(pairs: &[String]) -> Result<FieldPatch> {
    let mut patch = FieldPatch::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty key in '{}'", pair);
        }
        let trimmed = raw.trim();
        let structured = trimmed.starts_with('[') || trimmed.starts_with('{') || trimmed == "null";
        let value = if structured {
            serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
        } else {
            Value::String(raw.to_string())
        };
        patch.insert(key.to_string(), value);
    }
    Ok(patch)
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn print_progress<E>(state: &SessionState<E>) {
    match &state.save {
        SaveStatus::Idle => {}
        SaveStatus::Pending => println!("⏳ Changes pending"),
        SaveStatus::Saving => println!("💾 Saving..."),
        SaveStatus::Saved { at } => {
            println!("\x1b[32m✅ Saved at {}\x1b[0m", at.format("%H:%M:%S"))
        }
        SaveStatus::Error { message } => println!("\x1b[31m❌ Save failed: {}\x1b[0m", message),
    }
    match &state.provisioning {
        Provisioning::Idle => {}
        Provisioning::Watching { ticks, .. } => {
            println!("🔄 Waiting for the backend (poll #{})", ticks)
        }
        Provisioning::Ready { .. } => println!("\x1b[32m✅ Provisioning complete\x1b[0m"),
        Provisioning::Stalled { .. } => {
            println!("\x1b[33m⚠️  Still provisioning, stopped waiting\x1b[0m")
        }
    }
}

/// Print each distinct status until `done` holds.
async fn follow<E: Entity>(
    session: &EditSession<E>,
    done: impl Fn(&SessionState<E>) -> bool,
) -> Result<SessionState<E>> {
    let mut rx = session.subscribe();
    let mut last: Option<(SaveStatus, Provisioning)> = None;
    loop {
        let state = rx.borrow_and_update().clone();
        let seen = (state.save.clone(), state.provisioning.clone());
        if last.as_ref() != Some(&seen) {
            print_progress(&state);
            last = Some(seen);
        }
        if done(&state) {
            return Ok(state);
        }
        rx.changed()
            .await
            .map_err(|_| anyhow!("Session closed before the change settled"))?;
    }
}

fn saved<E>(state: &SessionState<E>) -> bool {
    state.save.is_settled()
}

fn saved_and_provisioned<E>(state: &SessionState<E>) -> bool {
    match state.save {
        SaveStatus::Error { .. } => true,
        SaveStatus::Saved { .. } => !matches!(state.provisioning, Provisioning::Watching { .. }),
        _ => false,
    }
}

fn ensure_saved<E>(state: &SessionState<E>) -> Result<()> {
    if let SaveStatus::Error { message } = &state.save {
        bail!("Save failed: {}", message);
    }
    Ok(())
}

fn print_publish_status(status: &PublishStatus) {
    match status {
        PublishStatus::Unpublished => println!("Publish:       not published"),
        PublishStatus::Pending { alias } => {
            println!("Publish:       \x1b[33m⏳ '{}' pending assignment\x1b[0m", alias)
        }
        PublishStatus::Unavailable { alias, owner } => {
            let what = match owner.kind {
                AssistantType::Agent => "agent",
                AssistantType::Workflow => "workflow",
            };
            println!(
                "Publish:       \x1b[31m❌ '{}' is taken by {} '{}' ({})\x1b[0m",
                alias, what, owner.name, owner.entity_id
            );
        }
        PublishStatus::Published { url, .. } => {
            println!("Publish:       \x1b[32m✅ {}\x1b[0m", url)
        }
    }
}

async fn resolve_publish_status(
    store: &dyn EntityStore,
    agent: &Agent,
    consumption_url: &str,
) -> PublishStatus {
    let assistants = if needs_directory(agent) {
        store.list_assistants().await.unwrap_or_else(|e| {
            warn!("Unable to list assistants: {}", e);
            Vec::new()
        })
    } else {
        Vec::new()
    };
    publish_status(agent, &assistants, consumption_url)
}

fn connect(config: &OttoConfig) -> Result<Arc<OttoClient>> {
    let client = OttoClient::new(config)?;
    if !client.has_token() {
        warn!("No API token configured, set [account].token or {}", TOKEN_ENV);
    }
    Ok(Arc::new(client))
}

async fn handle_agent(config: &OttoConfig, action: &AgentAction) -> Result<()> {
    let client = connect(config)?;
    let store: Arc<dyn EntityStore> = client.clone();
    let consumption_url = &config.console.consumption_url;

    match action {
        AgentAction::Show { id } => {
            let agent: Agent = fetch_entity(store.as_ref(), id).await?;
            println!("\n\x1b[1m🤖 {}\x1b[0m", agent.name);
            println!("ID:            {}", agent.id);
            if let Some(description) = &agent.description {
                println!("Description:   {}", description);
            }
            if let Some(model) = &agent.model {
                println!("Model:         {}", model);
            }
            if !agent.tools.is_empty() {
                println!("Tools:         {}", agent.tools.join(", "));
            }
            let status = resolve_publish_status(store.as_ref(), &agent, consumption_url).await;
            print_publish_status(&status);

            match client.list_knowledge_sources(id).await {
                Ok(sources) if !sources.is_empty() => {
                    println!("\nKnowledge:");
                    for source in sources {
                        println!(
                            "  - {} [{}] {:?}",
                            source.display_name(),
                            source.source_type().label(),
                            source.state
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Unable to list knowledge sources: {}", e),
            }
            println!();
        }
        AgentAction::Publish { id, alias } => {
            let session =
                EditSession::<Agent>::open(store.clone(), id, config.session.options()).await?;
            info!("Publishing {} as '{}'", id, alias);
            session.commit(field("alias", json!(alias)))?;
            let state = follow(&session, saved_and_provisioned).await?;
            ensure_saved(&state)?;
            let status =
                resolve_publish_status(store.as_ref(), &state.entity, consumption_url).await;
            print_publish_status(&status);
        }
        AgentAction::Unpublish { id } => {
            let session =
                EditSession::<Agent>::open(store.clone(), id, config.session.options()).await?;
            session.commit(field("alias", json!("")))?;
            let state = follow(&session, saved).await?;
            ensure_saved(&state)?;
            println!("✅ Unpublished {}", id);
        }
        AgentAction::Edit { id, assignments } => {
            let patch = parse_assignments(assignments)?;
            let session =
                EditSession::<Agent>::open(store.clone(), id, config.session.options()).await?;
            for (key, value) in patch {
                session.edit(field(&key, value))?;
            }
            let state = follow(&session, saved_and_provisioned).await?;
            ensure_saved(&state)?;
        }
    }
    Ok(())
}

async fn handle_model_provider(config: &OttoConfig, action: &ModelProviderAction) -> Result<()> {
    let store: Arc<dyn EntityStore> = connect(config)?;

    match action {
        ModelProviderAction::Configure { id, params } => {
            let mut credentials = BTreeMap::new();
            for (key, value) in parse_assignments(params)? {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                credentials.insert(key, value);
            }

            let session =
                EditSession::<ModelProvider>::open(store.clone(), id, config.session.options())
                    .await?;
            let provider = session.snapshot().entity;
            let missing = provider.missing_parameters(&credentials);
            if !missing.is_empty() {
                bail!("Missing required parameters: {}", missing.join(", "));
            }

            session.commit(field("config", json!(credentials)))?;
            let state = follow(&session, saved_and_provisioned).await?;
            ensure_saved(&state)?;
            if state.entity.models_back_populated {
                println!("✅ {} is ready to serve models\n", provider.name);
                let models = provider_models(store.as_ref(), id).await?;
                print_models(&models);
                if !models.is_empty() {
                    println!("\nAssign usage with: otto-console model set-usage <id> <usage>");
                }
            }
        }
    }
    Ok(())
}

fn print_models(models: &[Model]) {
    if models.is_empty() {
        println!("No models.");
        return;
    }
    for model in models {
        let state = if model.active { "" } else { " \x1b[33m(inactive)\x1b[0m" };
        println!(
            "  {:<24} {:<32} {}{}",
            model.id, model.name, model.usage, state
        );
    }
}

async fn handle_model(config: &OttoConfig, action: &ModelAction) -> Result<()> {
    let store: Arc<dyn EntityStore> = connect(config)?;

    match action {
        ModelAction::List { provider } => {
            let models = match provider {
                Some(provider) => provider_models(store.as_ref(), provider).await?,
                None => list_entities::<Model>(store.as_ref()).await?,
            };
            print_models(&models);
        }
        ModelAction::SetUsage { id, usage } => {
            let usage: ModelUsage = usage.parse().map_err(|e: String| anyhow!(e))?;
            let model = set_usage(store.as_ref(), id, usage).await?;
            println!("✅ {} is now used for {}", model.name, model.usage);
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_links(provider: OAuthProvider, api_base: &str) {
    let links = provider.links(api_base);
    println!("  Authorize:   {}", links.authorize_url);
    println!("  Redirect:    {}", links.redirect_url);
    println!("  Refresh:     {}", links.refresh_url);
}

async fn handle_oauth_app(config: &OttoConfig, action: &OAuthAppAction) -> Result<()> {
    match action {
        OAuthAppAction::Register { id, ref_name } => {
            let store: Arc<dyn EntityStore> = connect(config)?;
            let session =
                EditSession::<OAuthApp>::open(store, id, config.session.options()).await?;
            session.commit(field("refName", json!(ref_name)))?;
            let state = follow(&session, saved_and_provisioned).await?;
            ensure_saved(&state)?;

            let app = &state.entity;
            println!("\n\x1b[1m🔑 {} app '{}'\x1b[0m", app.provider, app.ref_name);
            print_links(app.provider, &config.api.base_url);
        }
        OAuthAppAction::List => {
            let store: Arc<dyn EntityStore> = connect(config)?;
            let apps = list_entities::<OAuthApp>(store.as_ref()).await?;
            for detail in combined_oauth_app_info(&apps) {
                match &detail.app {
                    Some(app) => {
                        let state = if app.ref_name_assigned {
                            "\x1b[32m✅ assigned\x1b[0m"
                        } else {
                            "\x1b[33m⏳ pending\x1b[0m"
                        };
                        println!(
                            "{:<16} {:<20} {} {}",
                            detail.provider, app.ref_name, app.id, state
                        );
                    }
                    None => println!("{:<16} \x1b[2mnot configured\x1b[0m", detail.provider),
                }
            }
        }
        OAuthAppAction::Delete { id, yes } => {
            if !*yes && !confirm(&format!("Delete OAuth app '{}'?", id))? {
                println!("Cancelled.");
                return Ok(());
            }
            let store: Arc<dyn EntityStore> = connect(config)?;
            store.delete(EntityKind::OAuthApp, id).await?;
            println!("✅ Deleted OAuth app {}", id);
        }
        OAuthAppAction::Providers => {
            for provider in OAuthProvider::ALL {
                let spec = provider.spec();
                println!("\n\x1b[1m{}\x1b[0m ({})", spec.display_name, provider.slug());
                println!("  Ref name:    {}", spec.ref_name);
                if !spec.extra_params.is_empty() {
                    println!("  Extra:       {}", spec.extra_params.join(", "));
                }
                print_links(provider, &config.api.base_url);
            }
            println!();
        }
    }
    Ok(())
}

fn field(key: &str, value: Value) -> FieldPatch {
    let mut patch = FieldPatch::new();
    patch.insert(key.to_string(), value);
    patch
}

async fn handle_demo() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    memory.insert(&Agent {
        id: "agent-42".into(),
        name: "Support Bot".into(),
        ..Default::default()
    })?;
    memory.add_assistant(Assistant {
        id: "helpdesk".into(),
        name: "Helpdesk Router".into(),
        entity_id: "wf-7".into(),
        kind: AssistantType::Workflow,
    });
    memory.provision_after(
        EntityKind::Agent,
        "agent-42",
        3,
        field("aliasAssigned", json!(true)),
    );

    let store: Arc<dyn EntityStore> = memory.clone();
    let options = SessionOptions {
        debounce: Duration::from_millis(300),
        poll_interval: Duration::from_millis(500),
        poll_timeout: Some(Duration::from_secs(10)),
    };
    let consumption_url = "https://otto.example.com";
    let session = EditSession::<Agent>::open(store.clone(), "agent-42", options).await?;

    println!("\n\x1b[1m✏️  Typing a new name\x1b[0m");
    for name in ["Support", "Support Bot v", "Support Bot v2"] {
        session.edit(field("name", json!(name)))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    follow(&session, saved).await?;
    println!("Updates sent:  {}", memory.updates().len());

    println!("\n\x1b[1m🔎 Checking alias 'helpdesk'\x1b[0m");
    let mut candidate = session.snapshot().entity;
    candidate.alias = "helpdesk".into();
    let status = resolve_publish_status(store.as_ref(), &candidate, consumption_url).await;
    print_publish_status(&status);

    println!("\n\x1b[1m🚀 Publishing as 'support-bot'\x1b[0m");
    session.commit(field("alias", json!("support-bot")))?;
    let state = follow(&session, saved_and_provisioned).await?;
    ensure_saved(&state)?;
    let status = resolve_publish_status(store.as_ref(), &state.entity, consumption_url).await;
    print_publish_status(&status);
    println!("Fetches:       {}", memory.fetches("agent-42"));
    println!();

    session.close();
    Ok(())
}

async fn handle_whoami(check_connection: bool) -> Result<()> {
    let config = OttoConfig::load()?;
    let config_path = if Path::new(CONFIG_FILE).exists() {
        format!("./{}", CONFIG_FILE)
    } else {
        "defaults (no otto.toml)".to_string()
    };

    println!("\n📋 Account Information\n");
    println!("Config:        {}", config_path);
    if let Some(name) = &config.account.name {
        println!("Name:          {}", name);
    }
    match config.token() {
        Some(token) => println!("Token:         {}", mask_token(&token)),
        None => println!("Token:         \x1b[33m⚠️  Not configured\x1b[0m"),
    }
    println!("API:           {}", config.api.base_url);
    println!("Published at:  {}", config.console.consumption_url);
    println!(
        "Session:       debounce {}ms, poll every {}ms, give up after {}",
        config.session.debounce_ms,
        config.session.poll_interval_ms,
        if config.session.poll_timeout_ms == 0 {
            "never".to_string()
        } else {
            format!("{}ms", config.session.poll_timeout_ms)
        }
    );

    if check_connection {
        print!("Status:        ");
        io::stdout().flush()?;

        let client = OttoClient::new(&config)?;
        match client.check_connection().await {
            Ok(true) => println!("\x1b[32m✅ Connected\x1b[0m"),
            Ok(false) => println!("\x1b[33m⚠️  Server unreachable\x1b[0m"),
            Err(e) => println!("\x1b[31m❌ Error: {}\x1b[0m", e),
        }
    }

    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("otto_console=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Agent { action } => handle_agent(&OttoConfig::load()?, action).await?,
        Commands::ModelProvider { action } => {
            handle_model_provider(&OttoConfig::load()?, action).await?
        }
        Commands::Model { action } => handle_model(&OttoConfig::load()?, action).await?,
        Commands::OauthApp { action } => handle_oauth_app(&OttoConfig::load()?, action).await?,
        Commands::Demo => handle_demo().await?,
        Commands::Whoami { check_connection } => handle_whoami(*check_connection).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignments() {
        let patch = parse_assignments(&[
            "name=Support Bot".to_string(),
            "tools=[\"search\"]".to_string(),
            "description=null".to_string(),
            "prompt=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(patch["name"], "Support Bot");
        assert_eq!(patch["tools"], json!(["search"]));
        assert_eq!(patch["description"], Value::Null);
        assert_eq!(patch["prompt"], "a=b");
    }

    #[test]
    fn test_parse_assignments_rejects_bare_words() {
        assert!(parse_assignments(&["alias".to_string()]).is_err());
        assert!(parse_assignments(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abcd"), "****");
        assert_eq!(mask_token("otto_1234567890"), "otto...7890");
        assert_eq!(mask_token("ключ_секретный_токен"), "ключ...окен");
        assert_eq!(mask_token("日本語"), "***");
    }

    #[test]
    fn test_provisioned_predicate() {
        let mut state = SessionState {
            entity: Agent::default(),
            save: SaveStatus::Saved { at: chrono::Utc::now() },
            provisioning: Provisioning::Watching {
                token: "agent-42".into(),
                ticks: 1,
            },
        };
        assert!(saved(&state));
        assert!(!saved_and_provisioned(&state));
        state.provisioning = Provisioning::Ready {
            token: "agent-42".into(),
        };
        assert!(saved_and_provisioned(&state));
    }
}
