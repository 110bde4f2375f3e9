// Protection slash commands for server administrators.

use crate::core::protection::{
    secs_to_ms, ActionSpec, EventFilter, EventKind, GuildScope, ProtectionError,
    ProtectionModule, Rule,
};
use crate::discord::{Data, Error};
use poise::serenity_prelude as serenity;

type Context<'a> = poise::Context<'a, Data, Error>;

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum ModuleChoice {
    #[name = "Anti-Spam"]
    AntiSpam,
    #[name = "Anti-Raid"]
    AntiRaid,
    #[name = "Anti-Nuke"]
    AntiNuke,
    #[name = "Anti-Link"]
    AntiLink,
    #[name = "Impersonation"]
    Impersonation,
}

impl From<ModuleChoice> for ProtectionModule {
    fn from(choice: ModuleChoice) -> Self {
        match choice {
            ModuleChoice::AntiSpam => ProtectionModule::AntiSpam,
            ModuleChoice::AntiRaid => ProtectionModule::AntiRaid,
            ModuleChoice::AntiNuke => ProtectionModule::AntiNuke,
            ModuleChoice::AntiLink => ProtectionModule::AntiLink,
            ModuleChoice::Impersonation => ProtectionModule::Impersonation,
        }
    }
}

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum EventChoice {
    #[name = "Messages"]
    Message,
    #[name = "Joins"]
    Join,
    #[name = "Destructive actions"]
    DestructiveAction,
    #[name = "Reactions"]
    Reaction,
    #[name = "Name changes"]
    NameChange,
}

impl From<EventChoice> for EventKind {
    fn from(choice: EventChoice) -> Self {
        match choice {
            EventChoice::Message => EventKind::Message,
            EventChoice::Join => EventKind::Join,
            EventChoice::DestructiveAction => EventKind::DestructiveAction,
            EventChoice::Reaction => EventKind::Reaction,
            EventChoice::NameChange => EventKind::NameChange,
        }
    }
}

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum ActionChoice {
    #[name = "Timeout"]
    Mute,
    #[name = "Delete message"]
    DeleteMessage,
    #[name = "Alert only"]
    Notify,
    #[name = "Lock down channels"]
    Lockdown,
    #[name = "Revoke privileged roles"]
    RoleRevoke,
    #[name = "Reset nickname"]
    ResetNickname,
}

/// Protection configuration commands.
///
/// Toggle modules, tune thresholds and manage custom rules.
#[poise::command(
    slash_command,
    subcommands(
        "status",
        "enable",
        "disable",
        "thresholds",
        "alerts",
        "addrule",
        "removerule",
        "pardon"
    ),
    required_permissions = "MANAGE_GUILD",
    guild_only
)]
pub async fn protection(_ctx: Context<'_>) -> Result<(), Error> {
    // Parent command - shows help
    Ok(())
}

fn flag(enabled: bool) -> &'static str {
    if enabled {
        "✅"
    } else {
        "❌"
    }
}

/// Show protection modules, thresholds and custom rules.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let config = ctx
        .data()
        .protection
        .config(guild_id.get())
        .await
        .map_err(|e| Error::from(e.to_string()))?;
    let active = ctx.data().protection.active_mitigations(guild_id.get());
    let stats = ctx.data().protection.stats();

    let modules = ProtectionModule::ALL
        .iter()
        .map(|m| format!("{} {}", flag(config.is_enabled(*m)), m))
        .collect::<Vec<_>>()
        .join("\n");

    let custom = if config.custom_rules.is_empty() {
        "None".to_string()
    } else {
        config
            .custom_rules
            .iter()
            .map(|r| {
                format!(
                    "{} `{}`: {} {} / {}s → {}",
                    flag(r.enabled),
                    r.id,
                    r.threshold,
                    r.event_kind,
                    r.window_ms / 1000,
                    r.action.label()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let alerts = match config.alert_channel_id {
        Some(id) => format!("<#{}>", id),
        None => "DM to server owner".to_string(),
    };

    let embed = serenity::CreateEmbed::new()
        .title("🛡️ Protection Status")
        .color(if config.any_enabled() { 0x00FF00 } else { 0xFF0000 })
        .field("Modules", modules, false)
        .field(
            "Thresholds",
            format!(
                "Spam: {} messages / {}s (timeout {} min)\n\
                 Raid: {} joins / {}s\n\
                 Nuke: {} actions / {}s",
                config.spam_threshold,
                config.spam_window_secs,
                config.mute_duration_secs / 60,
                config.raid_threshold,
                config.raid_window_secs,
                config.nuke_threshold,
                config.nuke_window_secs
            ),
            false,
        )
        .field("Alerts", alerts, true)
        .field("Active mitigations", active.len().to_string(), true)
        .field("Custom rules", custom, false)
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Engine: {} windows ({} events), {} cooldowns, {} queues, {} cached configs",
            stats.windows, stats.tracked_events, stats.records, stats.queues, stats.cached_configs
        )));

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Enable a protection module.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn enable(
    ctx: Context<'_>,
    #[description = "Module to enable"] module: ModuleChoice,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let module = ProtectionModule::from(module);

    ctx.data()
        .protection
        .set_module_enabled(guild_id.get(), module, true)
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    ctx.say(format!("✅ {} has been **enabled**.", module)).await?;
    Ok(())
}

/// Disable a protection module.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn disable(
    ctx: Context<'_>,
    #[description = "Module to disable"] module: ModuleChoice,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let module = ProtectionModule::from(module);

    ctx.data()
        .protection
        .set_module_enabled(guild_id.get(), module, false)
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    ctx.say(format!("❌ {} has been **disabled**.", module)).await?;
    Ok(())
}

/// Tune the built-in module thresholds.
#[allow(clippy::too_many_arguments)]
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn thresholds(
    ctx: Context<'_>,
    #[description = "Messages per spam window (default: 5)"]
    #[min = 1]
    #[max = 100]
    spam_messages: Option<u32>,
    #[description = "Spam window in seconds (default: 10)"]
    #[min = 1]
    #[max = 3600]
    spam_window_secs: Option<u64>,
    #[description = "Joins per raid window (default: 10)"]
    #[min = 1]
    #[max = 1000]
    raid_joins: Option<u32>,
    #[description = "Raid window in seconds (default: 60)"]
    #[min = 1]
    #[max = 86400]
    raid_window_secs: Option<u64>,
    #[description = "Destructive actions per nuke window (default: 3)"]
    #[min = 1]
    #[max = 100]
    nuke_actions: Option<u32>,
    #[description = "Nuke window in seconds (default: 10)"]
    #[min = 1]
    #[max = 3600]
    nuke_window_secs: Option<u64>,
    #[description = "Spam timeout in minutes (default: 10, max 28 days)"]
    #[min = 1]
    #[max = 40320]
    mute_minutes: Option<u64>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let result = ctx
        .data()
        .protection
        .update_config(guild_id.get(), |config| {
            if let Some(v) = spam_messages {
                config.spam_threshold = v;
            }
            if let Some(v) = spam_window_secs {
                config.spam_window_secs = v;
            }
            if let Some(v) = raid_joins {
                config.raid_threshold = v;
            }
            if let Some(v) = raid_window_secs {
                config.raid_window_secs = v;
            }
            if let Some(v) = nuke_actions {
                config.nuke_threshold = v;
            }
            if let Some(v) = nuke_window_secs {
                config.nuke_window_secs = v;
            }
            if let Some(v) = mute_minutes {
                config.mute_duration_secs = v.saturating_mul(60);
            }
        })
        .await;

    let config = match result {
        Ok(config) => config,
        Err(e @ ProtectionError::InvalidRule { .. }) => {
            ctx.say(format!("❌ {}", e)).await?;
            return Ok(());
        }
        Err(e) => return Err(Error::from(e.to_string())),
    };

    ctx.say(format!(
        "✅ Protection thresholds updated!\n\
         • Spam: {} msgs / {} sec → {} min timeout\n\
         • Raid: {} joins / {} sec\n\
         • Nuke: {} actions / {} sec",
        config.spam_threshold,
        config.spam_window_secs,
        config.mute_duration_secs / 60,
        config.raid_threshold,
        config.raid_window_secs,
        config.nuke_threshold,
        config.nuke_window_secs
    ))
    .await?;
    Ok(())
}

/// Set the channel protection alerts go to. Leave empty to DM the owner.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn alerts(
    ctx: Context<'_>,
    #[description = "Alert channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let channel_id = channel.as_ref().map(|c| c.id.get());

    ctx.data()
        .protection
        .update_config(guild_id.get(), |config| config.alert_channel_id = channel_id)
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    match channel_id {
        Some(id) => ctx.say(format!("✅ Protection alerts will be sent to <#{}>.", id)).await?,
        None => ctx.say("✅ Protection alerts will be sent to the server owner.").await?,
    };
    Ok(())
}

/// Add or replace a custom rate rule.
#[allow(clippy::too_many_arguments)]
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn addrule(
    ctx: Context<'_>,
    #[description = "Rule name"] id: String,
    #[description = "Activity to count"] event: EventChoice,
    #[description = "Events allowed in the window before the rule fires"]
    #[min = 1]
    #[max = 10000]
    threshold: u32,
    #[description = "Window length in seconds"]
    #[min = 1]
    #[max = 86400]
    window_secs: u64,
    #[description = "What to do when it fires"] action: ActionChoice,
    #[description = "Timeout length in minutes (default: 10, max 28 days)"]
    #[min = 1]
    #[max = 40320]
    mute_minutes: Option<u64>,
    #[description = "Only count messages containing one of these comma-separated words"]
    keywords: Option<String>,
    #[description = "Only count messages with at least this many mentions"]
    #[min = 1]
    #[max = 100]
    min_mentions: Option<u32>,
    #[description = "Only count messages with invite or executable links"]
    links_only: Option<bool>,
    #[description = "Lower fires first"] priority: Option<i32>,
    #[description = "Seconds before the rule can punish the same member again"]
    #[min = 0]
    #[max = 2592000]
    cooldown_secs: Option<u64>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let step = match action {
        ActionChoice::Mute => ActionSpec::Mute {
            duration_ms: secs_to_ms(mute_minutes.unwrap_or(10).saturating_mul(60)),
        },
        ActionChoice::DeleteMessage => ActionSpec::DeleteMessage,
        ActionChoice::Notify => ActionSpec::alert_staff(format!("rule `{}` triggered", id)),
        ActionChoice::Lockdown => ActionSpec::ChannelLockdown {
            slowmode_secs: Some(10),
        },
        ActionChoice::RoleRevoke => ActionSpec::RoleRevoke,
        ActionChoice::ResetNickname => ActionSpec::ResetNickname,
    };
    let action = match step {
        ActionSpec::Notify { .. } => step,
        step => ActionSpec::Composite(vec![
            step,
            ActionSpec::alert_staff(format!("rule `{}` triggered", id)),
        ]),
    };

    let filter = if let Some(words) = keywords {
        EventFilter::ContainsKeyword(
            words
                .split(',')
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect(),
        )
    } else if let Some(min) = min_mentions {
        EventFilter::MinMentions(min)
    } else if links_only.unwrap_or(false) {
        EventFilter::ContainsLink
    } else {
        EventFilter::Any
    };

    let rule = Rule {
        id: id.trim().to_string(),
        scope: GuildScope::Guild(guild_id.get()),
        event_kind: event.into(),
        window_ms: secs_to_ms(window_secs),
        threshold,
        action,
        enabled: true,
        priority,
        cooldown_ms: cooldown_secs.map(secs_to_ms),
        filter,
    };
    let label = rule.action.label();

    match ctx.data().protection.add_rule(guild_id.get(), rule).await {
        Ok(_) => {
            ctx.say(format!(
                "✅ Rule `{}` saved: {} {:?} events / {}s → {}",
                id.trim(),
                threshold,
                event,
                window_secs,
                label
            ))
            .await?;
        }
        Err(e @ ProtectionError::InvalidRule { .. }) => {
            ctx.say(format!("❌ {}", e)).await?;
        }
        Err(e) => return Err(Error::from(e.to_string())),
    }
    Ok(())
}

/// Remove a custom rule.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn removerule(
    ctx: Context<'_>,
    #[description = "Rule name"] id: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let removed = ctx
        .data()
        .protection
        .remove_rule(guild_id.get(), id.trim())
        .await
        .map_err(|e| Error::from(e.to_string()))?;

    if removed {
        ctx.say(format!("✅ Rule `{}` removed.", id.trim())).await?;
    } else {
        ctx.say(format!("❌ No custom rule named `{}`.", id.trim()))
            .await?;
    }
    Ok(())
}

/// Lift active mitigations for a member so rules can fire again.
#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn pardon(
    ctx: Context<'_>,
    #[description = "Member to pardon"] user: serenity::User,
    #[description = "Only this rule (default: all)"] rule: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;

    let cleared = ctx
        .data()
        .protection
        .pardon(guild_id.get(), user.id.get(), rule.as_deref());

    ctx.say(format!(
        "✅ Cleared {} active mitigation{} for <@{}>.",
        cleared,
        if cleared == 1 { "" } else { "s" },
        user.id
    ))
    .await?;
    Ok(())
}
