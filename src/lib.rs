// src/lib.rs

// ============================================================================
// 模块定义 (Modules)
// ============================================================================

pub mod core;
pub mod services;

// ============================================================================
// 公共导出 (Public Exports)
// ============================================================================

pub use core::buffer::{merge, LocalBuffer};
pub use core::debounce::Debouncer;
pub use core::entity::{
    apply_patch, coalesce, Agent, Entity, EntityKind, FieldPatch, ModelProvider, OAuthApp,
};
pub use core::models::{Model, ModelUsage};
pub use core::providers::{
    combined_oauth_app_info, KnowledgeSource, KnowledgeSourceType, OAuthAppDetail, OAuthLinks,
    OAuthProvider,
};
pub use core::publish::{publish_status, Assistant, PublishStatus};
pub use core::session::{
    EditSession, Provisioning, SaveStatus, SessionError, SessionOptions, SessionState,
};
pub use core::watcher::{TickOutcome, Watcher};

pub use services::config::OttoConfig;
pub use services::interface::{EntityStore, StoreError};
pub use services::memory::MemoryStore;
pub use services::otto::OttoClient;
