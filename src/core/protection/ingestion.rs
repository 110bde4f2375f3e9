// Event ingestion - turns platform events into `AbuseEvent`s.
//
// The Discord layer flattens serenity events into `RawPlatformEvent` so the
// filtering rules here stay testable without a gateway connection.

use super::protection_models::{AbuseEvent, EventKind};

/// Audit-log action types the normalizer distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    GuildUpdate,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    RoleCreate,
    RoleUpdate,
    RoleDelete,
    BanAdd,
    BanRemove,
    MemberKick,
    MemberPrune,
    Other,
}

impl AuditAction {
    /// Actions that count toward anti-nuke.
    pub fn is_destructive(&self) -> bool {
        !matches!(self, AuditAction::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::GuildUpdate => "guild_update",
            AuditAction::ChannelCreate => "channel_create",
            AuditAction::ChannelUpdate => "channel_update",
            AuditAction::ChannelDelete => "channel_delete",
            AuditAction::RoleCreate => "role_create",
            AuditAction::RoleUpdate => "role_update",
            AuditAction::RoleDelete => "role_delete",
            AuditAction::BanAdd => "ban_add",
            AuditAction::BanRemove => "ban_remove",
            AuditAction::MemberKick => "member_kick",
            AuditAction::MemberPrune => "member_prune",
            AuditAction::Other => "other",
        }
    }
}

/// Platform primitives, already stripped of library types.
#[derive(Debug, Clone)]
pub enum RawPlatformEvent {
    MessageCreate {
        guild_id: Option<u64>,
        author_id: u64,
        author_is_bot: bool,
        channel_id: u64,
        message_id: u64,
        content: String,
        mention_count: u32,
        timestamp_ms: i64,
    },
    MemberJoin {
        guild_id: u64,
        user_id: u64,
        is_bot: bool,
        timestamp_ms: i64,
    },
    AuditLogEntry {
        guild_id: u64,
        executor_id: Option<u64>,
        /// Our own user id, so self-inflicted entries are ignored
        bot_id: u64,
        /// Executor is the owner or holds ADMINISTRATOR; `None` when that
        /// could not be resolved
        executor_is_privileged: Option<bool>,
        action: AuditAction,
        target_id: Option<u64>,
        timestamp_ms: i64,
    },
    ReactionAdd {
        guild_id: Option<u64>,
        user_id: u64,
        user_is_bot: bool,
        channel_id: u64,
        message_id: u64,
        timestamp_ms: i64,
    },
    MemberRename {
        guild_id: u64,
        user_id: u64,
        is_bot: bool,
        is_privileged: Option<bool>,
        old_name: String,
        new_name: String,
        timestamp_ms: i64,
    },
}

pub struct EventNormalizer;

impl EventNormalizer {
    /// Normalize a platform event, or `None` when it should be ignored.
    ///
    /// Joins are keyed by guild: a raid is many users joining, not one user
    /// joining many times.
    pub fn normalize(raw: RawPlatformEvent) -> Option<AbuseEvent> {
        match raw {
            RawPlatformEvent::MessageCreate {
                guild_id,
                author_id,
                author_is_bot,
                channel_id,
                message_id,
                content,
                mention_count,
                timestamp_ms,
            } => {
                let guild_id = guild_id?;
                if author_is_bot {
                    return None;
                }
                Some(
                    AbuseEvent::new(author_id, guild_id, EventKind::Message, timestamp_ms)
                        .with_meta("channel_id", channel_id)
                        .with_meta("message_id", message_id)
                        .with_meta("mention_count", mention_count)
                        .with_meta("content", content),
                )
            }
            RawPlatformEvent::MemberJoin {
                guild_id,
                user_id,
                is_bot,
                timestamp_ms,
            } => {
                if is_bot {
                    return None;
                }
                Some(
                    AbuseEvent::new(guild_id, guild_id, EventKind::Join, timestamp_ms)
                        .with_meta("user_id", user_id),
                )
            }
            RawPlatformEvent::AuditLogEntry {
                guild_id,
                executor_id,
                bot_id,
                executor_is_privileged,
                action,
                target_id,
                timestamp_ms,
            } => {
                let executor_id = executor_id?;
                // Unresolved members are never punished
                let privileged = executor_is_privileged.unwrap_or(true);
                if executor_id == bot_id || privileged || !action.is_destructive() {
                    return None;
                }
                let mut event = AbuseEvent::new(
                    executor_id,
                    guild_id,
                    EventKind::DestructiveAction,
                    timestamp_ms,
                )
                .with_meta("action", action.as_str());
                if let Some(target_id) = target_id {
                    event = event.with_meta("target_id", target_id);
                }
                Some(event)
            }
            RawPlatformEvent::ReactionAdd {
                guild_id,
                user_id,
                user_is_bot,
                channel_id,
                message_id,
                timestamp_ms,
            } => {
                let guild_id = guild_id?;
                if user_is_bot {
                    return None;
                }
                Some(
                    AbuseEvent::new(user_id, guild_id, EventKind::Reaction, timestamp_ms)
                        .with_meta("channel_id", channel_id)
                        .with_meta("message_id", message_id),
                )
            }
            RawPlatformEvent::MemberRename {
                guild_id,
                user_id,
                is_bot,
                is_privileged,
                old_name,
                new_name,
                timestamp_ms,
            } => {
                if is_bot || is_privileged.unwrap_or(true) || old_name == new_name {
                    return None;
                }
                Some(
                    AbuseEvent::new(user_id, guild_id, EventKind::NameChange, timestamp_ms)
                        .with_meta("old_name", old_name)
                        .with_meta("new_name", new_name),
                )
            }
        }
    }
}
