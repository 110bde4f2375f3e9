pub mod config_store;
pub mod dispatcher;
pub mod filters;
pub mod ingestion;
pub mod observability;
pub mod protection_errors;
pub mod protection_models;
pub mod protection_service;
pub mod rule_engine;
pub mod sliding_window;

pub use config_store::ProtectionConfigStore;
pub use dispatcher::{ActionProvider, MitigationTarget};
pub use ingestion::{AuditAction, EventNormalizer, RawPlatformEvent};
pub use observability::TracingSink;
pub use protection_errors::{ActionError, ProtectionError, StoreError};
pub use protection_models::{
    secs_to_ms, ActionSpec, EngineSettings, EventFilter, EventKind, GuildProtectionConfig,
    GuildScope, ProtectionModule, Rule,
};
pub use protection_service::ProtectionService;
