// Error taxonomy for the protection engine.
//
// Every one of these is local to a single key, guild or action. Callers log
// them and keep processing other events.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtectionError {
    /// The window map is full and refused a new key. Fail open.
    #[error("Window capacity exceeded ({limit} keys)")]
    CapacityExceeded { limit: usize },

    /// No cached config and the store is down. Treat the guild as unprotected.
    #[error("Configuration unavailable for guild {guild_id}: {source}")]
    ConfigUnavailable {
        guild_id: u64,
        #[source]
        source: StoreError,
    },

    #[error("Invalid rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Failure reported by an action capability.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error("Missing permission: {0}")]
    PermissionDenied(String),

    /// Member, channel or message no longer exists
    #[error("Target gone: {0}")]
    TargetGone(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl ActionError {
    /// Soft failures are logged and skipped inside composite actions.
    pub fn is_soft(&self) -> bool {
        matches!(self, ActionError::TargetGone(_))
    }
}

/// Failure of the persistence collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
