// Discord-side mitigation actions - carries out what the dispatcher decides.
//
// Every method maps serenity failures onto `ActionError` so the dispatcher can
// tell missing permissions and vanished targets apart from API outages.

use crate::core::protection::{ActionError, ActionProvider, MitigationTarget};
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;

/// Discord caps member timeouts at 28 days.
const MAX_TIMEOUT: Duration = Duration::from_secs(28 * 24 * 60 * 60);

pub struct SerenityActionProvider {
    http: Arc<serenity::Http>,
    cache: Arc<serenity::Cache>,
}

impl SerenityActionProvider {
    pub fn new(http: Arc<serenity::Http>, cache: Arc<serenity::Cache>) -> Self {
        Self { http, cache }
    }

    fn audit_reason(target: &MitigationTarget) -> String {
        format!("Strive protection: {}", target.rule_id)
    }

    /// Owner from the cache, falling back to the REST API.
    async fn guild_owner(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<serenity::UserId, ActionError> {
        let cached = self.cache.guild(guild_id).map(|guild| guild.owner_id);
        match cached {
            Some(owner_id) => Ok(owner_id),
            None => guild_id
                .to_partial_guild(&self.http)
                .await
                .map(|guild| guild.owner_id)
                .map_err(map_serenity_error),
        }
    }
}

fn guild(target: &MitigationTarget) -> serenity::GuildId {
    serenity::GuildId::new(target.guild_id)
}

fn member(target: &MitigationTarget) -> serenity::UserId {
    serenity::UserId::new(target.subject_key)
}

/// Permissions that make a role dangerous in the wrong hands.
fn privileged_permissions() -> serenity::Permissions {
    serenity::Permissions::ADMINISTRATOR
        | serenity::Permissions::MANAGE_GUILD
        | serenity::Permissions::MANAGE_ROLES
        | serenity::Permissions::MANAGE_CHANNELS
        | serenity::Permissions::MANAGE_WEBHOOKS
        | serenity::Permissions::BAN_MEMBERS
        | serenity::Permissions::KICK_MEMBERS
}

/// 403 means we lack permissions, 404 that the member, channel or message is gone.
fn classify_status(status: Option<u16>, detail: String) -> ActionError {
    match status {
        Some(403) => ActionError::PermissionDenied(detail),
        Some(404) => ActionError::TargetGone(detail),
        _ => ActionError::Platform(detail),
    }
}

pub(crate) fn map_serenity_error(e: serenity::Error) -> ActionError {
    let status = match &e {
        serenity::Error::Http(http_error) => http_error.status_code().map(|s| s.as_u16()),
        _ => None,
    };
    classify_status(status, e.to_string())
}

#[async_trait]
impl ActionProvider for SerenityActionProvider {
    async fn mute(&self, target: &MitigationTarget, duration: Duration) -> Result<(), ActionError> {
        let duration = duration.min(MAX_TIMEOUT);
        let until = serenity::Timestamp::from_unix_timestamp(
            chrono::Utc::now().timestamp() + duration.as_secs() as i64,
        )
        .map_err(|e| ActionError::Platform(format!("Invalid timeout timestamp: {}", e)))?;

        let reason = Self::audit_reason(target);
        guild(target)
            .edit_member(
                &self.http,
                member(target),
                serenity::EditMember::new()
                    .disable_communication_until_datetime(until)
                    .audit_log_reason(&reason),
            )
            .await
            .map_err(map_serenity_error)?;

        tracing::info!(
            guild_id = target.guild_id,
            user_id = target.subject_key,
            secs = duration.as_secs(),
            "Member timed out"
        );
        Ok(())
    }

    async fn lockdown(
        &self,
        target: &MitigationTarget,
        slowmode_secs: Option<u16>,
    ) -> Result<(), ActionError> {
        let guild_id = guild(target);
        let everyone = serenity::RoleId::new(guild_id.get());
        let channels = guild_id
            .channels(&self.http)
            .await
            .map_err(map_serenity_error)?;

        let mut locked = 0usize;
        let mut last_error = None;
        for channel in channels.values() {
            if channel.kind != serenity::ChannelType::Text {
                continue;
            }
            // Channels @everyone already can't post in are not public
            let already_denied = channel.permission_overwrites.iter().any(|overwrite| {
                overwrite.kind == serenity::PermissionOverwriteType::Role(everyone)
                    && overwrite.deny.send_messages()
            });
            if already_denied {
                continue;
            }

            if let Some(secs) = slowmode_secs {
                if let Err(e) = channel
                    .id
                    .edit(&self.http, serenity::EditChannel::new().rate_limit_per_user(secs))
                    .await
                {
                    tracing::warn!(channel_id = %channel.id, "Failed to set slowmode: {}", e);
                }
            }

            let overwrite = serenity::PermissionOverwrite {
                allow: serenity::Permissions::empty(),
                deny: serenity::Permissions::SEND_MESSAGES,
                kind: serenity::PermissionOverwriteType::Role(everyone),
            };
            match channel.id.create_permission(&self.http, overwrite).await {
                Ok(()) => locked += 1,
                Err(e) => {
                    tracing::warn!(channel_id = %channel.id, "Failed to lock channel: {}", e);
                    last_error = Some(map_serenity_error(e));
                }
            }
        }

        tracing::warn!(guild_id = target.guild_id, locked, "Raid lockdown applied");
        match last_error {
            Some(e) if locked == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn revoke_roles(&self, target: &MitigationTarget) -> Result<(), ActionError> {
        let guild_id = guild(target);
        let user_id = member(target);

        let current = guild_id
            .member(&self.http, user_id)
            .await
            .map_err(map_serenity_error)?;
        let roles = guild_id
            .roles(&self.http)
            .await
            .map_err(map_serenity_error)?;

        let dangerous = privileged_permissions();
        let kept: Vec<serenity::RoleId> = current
            .roles
            .iter()
            .copied()
            .filter(|role_id| {
                roles
                    .get(role_id)
                    .map(|role| !role.permissions.intersects(dangerous))
                    .unwrap_or(true)
            })
            .collect();
        let revoked = current.roles.len() - kept.len();

        let reason = Self::audit_reason(target);
        guild_id
            .edit_member(
                &self.http,
                user_id,
                serenity::EditMember::new().roles(kept).audit_log_reason(&reason),
            )
            .await
            .map_err(map_serenity_error)?;

        tracing::warn!(
            guild_id = target.guild_id,
            user_id = target.subject_key,
            revoked,
            "Privileged roles revoked"
        );
        Ok(())
    }

    async fn notify(&self, target: &MitigationTarget, message: &str) -> Result<(), ActionError> {
        // Join floods are keyed by guild, there is no single member to mention
        let subject = if target.subject_key == target.guild_id {
            "this server".to_string()
        } else {
            format!("<@{}>", target.subject_key)
        };
        let text = format!("🚨 **{}** ({}): {}", target.rule_id, subject, message);

        if let Some(channel_id) = target.meta_u64("alert_channel_id") {
            serenity::ChannelId::new(channel_id)
                .say(&self.http, &text)
                .await
                .map_err(map_serenity_error)?;
            return Ok(());
        }

        let owner_id = self.guild_owner(guild(target)).await?;
        owner_id
            .direct_message(&self.http, serenity::CreateMessage::new().content(text))
            .await
            .map_err(map_serenity_error)?;
        Ok(())
    }

    async fn warn(&self, target: &MitigationTarget, message: &str) -> Result<(), ActionError> {
        if target.subject_key == target.guild_id {
            return Err(ActionError::TargetGone(
                "join floods have no single member to warn".to_string(),
            ));
        }

        // Reply where the offence happened, otherwise privately
        if let Some(channel_id) = target.meta_u64("channel_id") {
            serenity::ChannelId::new(channel_id)
                .say(&self.http, format!("⚠️ <@{}> {}", target.subject_key, message))
                .await
                .map_err(map_serenity_error)?;
            return Ok(());
        }

        member(target)
            .direct_message(
                &self.http,
                serenity::CreateMessage::new().content(format!("⚠️ {}", message)),
            )
            .await
            .map_err(map_serenity_error)?;
        Ok(())
    }

    async fn delete_message(&self, target: &MitigationTarget) -> Result<(), ActionError> {
        let (Some(channel_id), Some(message_id)) =
            (target.meta_u64("channel_id"), target.meta_u64("message_id"))
        else {
            return Err(ActionError::TargetGone(
                "event carries no message to delete".to_string(),
            ));
        };

        serenity::ChannelId::new(channel_id)
            .delete_message(&self.http, serenity::MessageId::new(message_id))
            .await
            .map_err(map_serenity_error)
    }

    async fn reset_nickname(&self, target: &MitigationTarget) -> Result<(), ActionError> {
        let Some(old_name) = target.meta_str("old_name") else {
            return Err(ActionError::TargetGone("previous name unknown".to_string()));
        };

        let reason = Self::audit_reason(target);
        guild(target)
            .edit_member(
                &self.http,
                member(target),
                serenity::EditMember::new()
                    .nickname(old_name)
                    .audit_log_reason(&reason),
            )
            .await
            .map_err(map_serenity_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_maps_to_permission_denied() {
        let err = classify_status(Some(403), "Missing Permissions".to_string());
        assert_eq!(err, ActionError::PermissionDenied("Missing Permissions".to_string()));
        assert!(!err.is_soft());
    }

    #[test]
    fn test_not_found_maps_to_target_gone() {
        let err = classify_status(Some(404), "Unknown Member".to_string());
        assert_eq!(err, ActionError::TargetGone("Unknown Member".to_string()));
        assert!(err.is_soft());
    }

    #[test]
    fn test_other_failures_are_platform_errors() {
        assert!(matches!(
            classify_status(Some(500), "Internal Server Error".to_string()),
            ActionError::Platform(_)
        ));
        assert!(matches!(
            map_serenity_error(serenity::Error::Other("gateway closed")),
            ActionError::Platform(_)
        ));
    }
}
