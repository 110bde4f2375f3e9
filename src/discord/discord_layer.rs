// Discord layer - commands and event handlers.

use crate::core::protection::ProtectionService;
use crate::infra::protection::SqliteProtectionStore;
use std::sync::Arc;

#[path = "protection/mod.rs"]
pub mod protection;

pub type Protection = ProtectionService<SqliteProtectionStore, protection::SerenityActionProvider>;

/// Shared state available to every command and event handler.
pub struct Data {
    pub protection: Arc<Protection>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
