// Gateway event translation for the protection engine.
//
// Pulls the few primitives the engine needs out of serenity events, runs them
// through the normalizer and hands the result to the protection service.

use crate::core::protection::{AuditAction, EventNormalizer, ProtectionError, RawPlatformEvent};
use crate::discord::{Data, Error};
use ::serenity::model::guild::audit_log::{Action, ChannelAction, MemberAction, RoleAction};
use poise::serenity_prelude as serenity;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Owner or a member of any role that `is_admin_role` accepts.
fn privileged_by_roles(
    owner_id: serenity::UserId,
    user_id: serenity::UserId,
    member_roles: &[serenity::RoleId],
    is_admin_role: impl Fn(&serenity::RoleId) -> bool,
) -> bool {
    owner_id == user_id || member_roles.iter().any(is_admin_role)
}

/// Privilege from the cache, `None` when the guild or member isn't cached.
fn cached_privilege(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    user_id: serenity::UserId,
) -> Option<bool> {
    let guild = ctx.cache.guild(guild_id)?;
    if guild.owner_id == user_id {
        return Some(true);
    }
    let member = guild.members.get(&user_id)?;
    Some(privileged_by_roles(guild.owner_id, user_id, &member.roles, |role_id| {
        guild
            .roles
            .get(role_id)
            .map(|role| role.permissions.administrator())
            .unwrap_or(false)
    }))
}

async fn fetch_privilege(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    user_id: serenity::UserId,
) -> Result<bool, serenity::Error> {
    let guild = guild_id.to_partial_guild(&ctx.http).await?;
    let member = guild_id.member(&ctx.http, user_id).await?;
    Ok(privileged_by_roles(guild.owner_id, user_id, &member.roles, |role_id| {
        guild
            .roles
            .get(role_id)
            .map(|role| role.permissions.administrator())
            .unwrap_or(false)
    }))
}

/// Owner or ADMINISTRATOR. Large guilds don't cache every member, so misses
/// go to the REST API; `None` when neither can tell.
async fn is_privileged(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    user_id: serenity::UserId,
) -> Option<bool> {
    if let Some(privileged) = cached_privilege(ctx, guild_id, user_id) {
        return Some(privileged);
    }
    match fetch_privilege(ctx, guild_id, user_id).await {
        Ok(privileged) => Some(privileged),
        Err(e) => {
            tracing::debug!(
                guild_id = %guild_id,
                user_id = %user_id,
                "Could not resolve member privileges: {}",
                e
            );
            None
        }
    }
}

fn audit_action(action: &Action) -> AuditAction {
    match action {
        Action::GuildUpdate => AuditAction::GuildUpdate,
        Action::Channel(ChannelAction::Create) => AuditAction::ChannelCreate,
        Action::Channel(ChannelAction::Update) => AuditAction::ChannelUpdate,
        Action::Channel(ChannelAction::Delete) => AuditAction::ChannelDelete,
        Action::Role(RoleAction::Create) => AuditAction::RoleCreate,
        Action::Role(RoleAction::Update) => AuditAction::RoleUpdate,
        Action::Role(RoleAction::Delete) => AuditAction::RoleDelete,
        Action::Member(MemberAction::BanAdd) => AuditAction::BanAdd,
        Action::Member(MemberAction::BanRemove) => AuditAction::BanRemove,
        Action::Member(MemberAction::Kick) => AuditAction::MemberKick,
        Action::Member(MemberAction::Prune) => AuditAction::MemberPrune,
        _ => AuditAction::Other,
    }
}

/// Flatten a gateway event into engine primitives, if the engine cares about it.
async fn to_raw_event(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
) -> Option<RawPlatformEvent> {
    let timestamp_ms = now_ms();
    match event {
        serenity::FullEvent::Message { new_message } => Some(RawPlatformEvent::MessageCreate {
            guild_id: new_message.guild_id.map(|id| id.get()),
            author_id: new_message.author.id.get(),
            author_is_bot: new_message.author.bot,
            channel_id: new_message.channel_id.get(),
            message_id: new_message.id.get(),
            content: new_message.content.clone(),
            mention_count: (new_message.mentions.len() + new_message.mention_roles.len()) as u32,
            timestamp_ms,
        }),
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            Some(RawPlatformEvent::MemberJoin {
                guild_id: new_member.guild_id.get(),
                user_id: new_member.user.id.get(),
                is_bot: new_member.user.bot,
                timestamp_ms,
            })
        }
        serenity::FullEvent::GuildAuditLogEntryCreate { entry, guild_id } => {
            let bot_id = ctx.cache.current_user().id.get();
            Some(RawPlatformEvent::AuditLogEntry {
                guild_id: guild_id.get(),
                executor_id: Some(entry.user_id.get()),
                bot_id,
                executor_is_privileged: is_privileged(ctx, *guild_id, entry.user_id).await,
                action: audit_action(&entry.action),
                target_id: entry.target_id.map(|id| id.get()),
                timestamp_ms,
            })
        }
        serenity::FullEvent::ReactionAdd { add_reaction } => {
            let user_id = add_reaction.user_id?;
            Some(RawPlatformEvent::ReactionAdd {
                guild_id: add_reaction.guild_id.map(|id| id.get()),
                user_id: user_id.get(),
                user_is_bot: add_reaction
                    .member
                    .as_ref()
                    .map(|member| member.user.bot)
                    .unwrap_or(false),
                channel_id: add_reaction.channel_id.get(),
                message_id: add_reaction.message_id.get(),
                timestamp_ms,
            })
        }
        serenity::FullEvent::GuildMemberUpdate {
            old_if_available,
            event: update,
            ..
        } => {
            // Without the previous state there is nothing to revert to
            let old_name = old_if_available.as_ref()?.display_name().to_string();
            let new_name = update
                .nick
                .clone()
                .or_else(|| update.user.global_name.clone())
                .unwrap_or_else(|| update.user.name.clone());
            Some(RawPlatformEvent::MemberRename {
                guild_id: update.guild_id.get(),
                user_id: update.user.id.get(),
                is_bot: update.user.bot,
                is_privileged: is_privileged(ctx, update.guild_id, update.user.id).await,
                old_name,
                new_name,
                timestamp_ms,
            })
        }
        _ => None,
    }
}

/// Protection hook for the framework's event handler.
pub async fn handle_event(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: &Data,
) -> Result<(), Error> {
    // The bot was removed from the guild, not an outage
    if let serenity::FullEvent::GuildDelete { incomplete, .. } = event {
        if !incomplete.unavailable {
            let guild_id = incomplete.id.get();
            if let Err(e) = data.protection.purge_guild(guild_id).await {
                tracing::warn!(guild_id, "Guild purge incomplete: {}", e);
            }
        }
        return Ok(());
    }

    let Some(raw) = to_raw_event(ctx, event).await else {
        return Ok(());
    };
    let Some(abuse_event) = EventNormalizer::normalize(raw) else {
        return Ok(());
    };

    match data.protection.handle_event(abuse_event).await {
        Ok(report) if report.outcomes.is_empty() => {}
        Ok(report) => {
            tracing::debug!(
                guild_id = report.guild_id,
                subject_key = report.subject_key,
                kind = %report.kind,
                applied = report.applied(),
                "Protection event handled"
            );
            for (rule_id, outcome) in &report.outcomes {
                tracing::debug!(
                    guild_id = report.guild_id,
                    subject_key = report.subject_key,
                    rule_id = %rule_id,
                    outcome = %outcome,
                    "Protection rule fired"
                );
            }
        }
        Err(e @ ProtectionError::ConfigUnavailable { .. }) => {
            tracing::warn!("Protection skipped: {}", e);
        }
        Err(e) => {
            tracing::error!("Protection failed: {}", e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: u64) -> serenity::UserId {
        serenity::UserId::new(id)
    }

    fn role(id: u64) -> serenity::RoleId {
        serenity::RoleId::new(id)
    }

    #[test]
    fn test_owner_is_privileged_without_roles() {
        assert!(privileged_by_roles(user(1), user(1), &[], |_| false));
    }

    #[test]
    fn test_admin_role_makes_member_privileged() {
        let admin = role(10);
        let roles = [role(11), admin];
        assert!(privileged_by_roles(user(1), user(2), &roles, |r| *r == admin));
        assert!(!privileged_by_roles(user(1), user(2), &roles[..1], |r| *r == admin));
    }
}
