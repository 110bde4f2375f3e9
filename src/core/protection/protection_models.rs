// Protection domain models - data structures for the abuse detection engine.
//
// These are pure domain types with no Discord dependencies.
// The Discord layer translates gateway events into `AbuseEvent`s and
// carries out the `ActionSpec`s that come back out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::ProtectionError;

/// Platform details attached to an event (content, channel id, names...).
pub type EventMetadata = BTreeMap<String, Value>;

/// Kind of platform activity an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Join,
    DestructiveAction,
    Reaction,
    NameChange,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Message => write!(f, "message"),
            EventKind::Join => write!(f, "join"),
            EventKind::DestructiveAction => write!(f, "destructive_action"),
            EventKind::Reaction => write!(f, "reaction"),
            EventKind::NameChange => write!(f, "name_change"),
        }
    }
}

/// A normalized, immutable fact about something that happened in a guild.
#[derive(Debug, Clone, PartialEq)]
pub struct AbuseEvent {
    /// Entity being rate-tracked (a user id, or the guild id for join floods)
    pub subject_key: u64,
    pub guild_id: u64,
    pub kind: EventKind,
    /// Milliseconds since the unix epoch
    pub timestamp_ms: i64,
    pub metadata: EventMetadata,
}

impl AbuseEvent {
    pub fn new(subject_key: u64, guild_id: u64, kind: EventKind, timestamp_ms: i64) -> Self {
        Self {
            subject_key,
            guild_id,
            kind,
            timestamp_ms,
            metadata: EventMetadata::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }
}

/// Where a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuildScope {
    Global,
    Guild(u64),
}

/// Extra condition an event must meet before it counts toward a rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    #[default]
    Any,
    /// Message content carries an invite or an executable download link
    ContainsLink,
    /// Message content contains one of these keywords (case-insensitive)
    ContainsKeyword(Vec<String>),
    /// New display name looks like a staff member's
    StaffLikeName,
    /// Message mentions at least this many users/roles
    MinMentions(u32),
}

/// Who a `Notify` step is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTarget {
    /// The alert channel, or the owner's DMs when none is set
    #[default]
    Staff,
    /// The member who triggered the rule, in the event's channel or by DM
    Offender,
}

/// Mitigation to run when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    /// Time the member out
    Mute { duration_ms: u64 },
    /// Deny @everyone SendMessages on public text channels, optionally with slowmode
    ChannelLockdown { slowmode_secs: Option<u16> },
    /// Strip privileged roles from the member
    RoleRevoke,
    /// Send a message to staff or to the offending member
    Notify {
        message: String,
        #[serde(default)]
        to: NotifyTarget,
    },
    /// Remove the triggering message
    DeleteMessage,
    /// Put the member's previous display name back
    ResetNickname,
    /// Run each step in order
    Composite(Vec<ActionSpec>),
}

impl ActionSpec {
    pub fn alert_staff(message: impl Into<String>) -> Self {
        ActionSpec::Notify {
            message: message.into(),
            to: NotifyTarget::Staff,
        }
    }

    pub fn tell_offender(message: impl Into<String>) -> Self {
        ActionSpec::Notify {
            message: message.into(),
            to: NotifyTarget::Offender,
        }
    }

    /// Steps whose failure is logged but does not stop a composite action.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, ActionSpec::Notify { .. } | ActionSpec::DeleteMessage)
    }

    /// Longest mute inside this action, used as the default cooldown.
    pub fn punishment_duration(&self) -> Option<Duration> {
        match self {
            ActionSpec::Mute { duration_ms } => Some(Duration::from_millis(*duration_ms)),
            ActionSpec::Composite(steps) => {
                steps.iter().filter_map(ActionSpec::punishment_duration).max()
            }
            _ => None,
        }
    }

    /// Short label for logs and command output.
    pub fn label(&self) -> String {
        match self {
            ActionSpec::Mute { duration_ms } => format!("mute {}s", duration_ms / 1000),
            ActionSpec::ChannelLockdown { .. } => "lockdown".to_string(),
            ActionSpec::RoleRevoke => "role revoke".to_string(),
            ActionSpec::Notify {
                to: NotifyTarget::Staff,
                ..
            } => "notify".to_string(),
            ActionSpec::Notify {
                to: NotifyTarget::Offender,
                ..
            } => "warn member".to_string(),
            ActionSpec::DeleteMessage => "delete message".to_string(),
            ActionSpec::ResetNickname => "reset nickname".to_string(),
            ActionSpec::Composite(steps) => steps
                .iter()
                .map(ActionSpec::label)
                .collect::<Vec<_>>()
                .join(" + "),
        }
    }
}

/// A declarative rate policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub scope: GuildScope,
    pub event_kind: EventKind,
    pub window_ms: u64,
    pub threshold: u32,
    pub action: ActionSpec,
    pub enabled: bool,
    /// Lower fires first; unset rules keep their registration order
    #[serde(default)]
    pub priority: Option<i32>,
    /// How long a fired mitigation suppresses repeats
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub filter: EventFilter,
}

impl Rule {
    pub fn validate(&self) -> Result<(), ProtectionError> {
        let invalid = |reason: &str| ProtectionError::InvalidRule {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("rule id must not be empty"));
        }
        if self.threshold < 1 {
            return Err(invalid("threshold must be at least 1"));
        }
        if self.window_ms == 0 {
            return Err(invalid("window must be greater than zero"));
        }
        if let ActionSpec::Composite(steps) = &self.action {
            if steps.is_empty() {
                return Err(invalid("composite action has no steps"));
            }
        }
        Ok(())
    }

    /// Cooldown applied after a successful mitigation.
    pub fn effective_cooldown(&self) -> Duration {
        self.cooldown_ms
            .map(Duration::from_millis)
            .or_else(|| self.action.punishment_duration())
            .unwrap_or_else(|| Duration::from_millis(self.window_ms))
    }
}

/// A rule crossing its threshold for one subject.
#[derive(Debug, Clone)]
pub struct Violation {
    pub rule: Rule,
    pub subject_key: u64,
    pub guild_id: u64,
    pub triggering_count: usize,
    pub window_start: i64,
    pub window_end: i64,
    /// Metadata of the triggering event, needed by actions (channel, message, names)
    pub metadata: EventMetadata,
}

/// Idempotency guard for a fired mitigation.
#[derive(Debug, Clone, PartialEq)]
pub struct MitigationRecord {
    pub subject_key: u64,
    pub guild_id: u64,
    pub rule_id: String,
    pub fired_at: i64,
    pub expires_at: i64,
}

/// What the dispatcher did with a violation.
#[derive(Debug, Clone, PartialEq)]
pub enum MitigationOutcome {
    Applied,
    /// A mitigation for the same subject and rule is still active
    Suppressed,
    Failed { reason: String },
    /// The guild was purged before the violation was handled
    Cancelled,
}

impl std::fmt::Display for MitigationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MitigationOutcome::Applied => write!(f, "applied"),
            MitigationOutcome::Suppressed => write!(f, "suppressed"),
            MitigationOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            MitigationOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Built-in protection modules a guild can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionModule {
    AntiSpam,
    AntiRaid,
    AntiNuke,
    AntiLink,
    Impersonation,
}

impl ProtectionModule {
    pub const ALL: [ProtectionModule; 5] = [
        ProtectionModule::AntiSpam,
        ProtectionModule::AntiRaid,
        ProtectionModule::AntiNuke,
        ProtectionModule::AntiLink,
        ProtectionModule::Impersonation,
    ];

    /// Rule id of the built-in rule backing this module.
    pub fn rule_id(&self) -> &'static str {
        match self {
            ProtectionModule::AntiSpam => "anti_spam",
            ProtectionModule::AntiRaid => "anti_raid",
            ProtectionModule::AntiNuke => "anti_nuke",
            ProtectionModule::AntiLink => "anti_link",
            ProtectionModule::Impersonation => "impersonation",
        }
    }
}

impl std::fmt::Display for ProtectionModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionModule::AntiSpam => write!(f, "Anti-Spam"),
            ProtectionModule::AntiRaid => write!(f, "Anti-Raid"),
            ProtectionModule::AntiNuke => write!(f, "Anti-Nuke"),
            ProtectionModule::AntiLink => write!(f, "Anti-Link"),
            ProtectionModule::Impersonation => write!(f, "Impersonation"),
        }
    }
}

/// Per-guild protection settings, persisted by the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildProtectionConfig {
    pub guild_id: u64,
    pub anti_spam_enabled: bool,
    pub anti_raid_enabled: bool,
    pub anti_nuke_enabled: bool,
    pub anti_link_enabled: bool,
    pub impersonation_enabled: bool,
    /// Messages allowed per spam window before muting
    pub spam_threshold: u32,
    pub spam_window_secs: u64,
    /// Joins per raid window before locking down
    pub raid_threshold: u32,
    pub raid_window_secs: u64,
    /// Destructive audit-log actions per nuke window before stripping roles
    pub nuke_threshold: u32,
    pub nuke_window_secs: u64,
    pub mute_duration_secs: u64,
    /// Where alerts go; the guild owner is DMed when unset
    pub alert_channel_id: Option<u64>,
    pub custom_rules: Vec<Rule>,
    /// Bumped on every save so rule indexes know when to rebuild
    pub revision: u64,
}

impl GuildProtectionConfig {
    /// Defaults for a guild with no stored settings: everything off.
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            anti_spam_enabled: false,
            anti_raid_enabled: false,
            anti_nuke_enabled: false,
            anti_link_enabled: false,
            impersonation_enabled: false,
            spam_threshold: 5,      // 5 messages...
            spam_window_secs: 10,   // ...in 10 seconds
            raid_threshold: 10,     // 10 joins...
            raid_window_secs: 60,   // ...in a minute
            nuke_threshold: 3,      // 3 destructive actions...
            nuke_window_secs: 10,   // ...in 10 seconds
            mute_duration_secs: 600, // 10 minute timeout
            alert_channel_id: None,
            custom_rules: Vec::new(),
            revision: 0,
        }
    }

    /// Whether these settings were ever saved. Every save bumps the revision,
    /// so only never-configured defaults sit at zero.
    pub fn is_stored(&self) -> bool {
        self.revision > 0
    }

    pub fn is_enabled(&self, module: ProtectionModule) -> bool {
        match module {
            ProtectionModule::AntiSpam => self.anti_spam_enabled,
            ProtectionModule::AntiRaid => self.anti_raid_enabled,
            ProtectionModule::AntiNuke => self.anti_nuke_enabled,
            ProtectionModule::AntiLink => self.anti_link_enabled,
            ProtectionModule::Impersonation => self.impersonation_enabled,
        }
    }

    pub fn set_enabled(&mut self, module: ProtectionModule, enabled: bool) {
        match module {
            ProtectionModule::AntiSpam => self.anti_spam_enabled = enabled,
            ProtectionModule::AntiRaid => self.anti_raid_enabled = enabled,
            ProtectionModule::AntiNuke => self.anti_nuke_enabled = enabled,
            ProtectionModule::AntiLink => self.anti_link_enabled = enabled,
            ProtectionModule::Impersonation => self.impersonation_enabled = enabled,
        }
    }

    pub fn any_enabled(&self) -> bool {
        ProtectionModule::ALL.iter().any(|m| self.is_enabled(*m))
            || self.custom_rules.iter().any(|r| r.enabled)
    }

    /// The guild's full rule set: built-in modules first, then custom rules.
    pub fn rules(&self) -> Vec<Rule> {
        let scope = GuildScope::Guild(self.guild_id);
        let mut rules = vec![
            Rule {
                id: ProtectionModule::AntiSpam.rule_id().to_string(),
                scope,
                event_kind: EventKind::Message,
                window_ms: secs_to_ms(self.spam_window_secs),
                threshold: self.spam_threshold,
                action: ActionSpec::Composite(vec![
                    ActionSpec::Mute {
                        duration_ms: secs_to_ms(self.mute_duration_secs),
                    },
                    ActionSpec::tell_offender(format!(
                        "you have been muted for {} minutes due to excessive messaging",
                        self.mute_duration_secs / 60
                    )),
                    ActionSpec::alert_staff(format!(
                        "muted for {} minutes due to excessive messaging",
                        self.mute_duration_secs / 60
                    )),
                ]),
                enabled: self.anti_spam_enabled,
                priority: None,
                cooldown_ms: None,
                filter: EventFilter::Any,
            },
            Rule {
                id: ProtectionModule::AntiRaid.rule_id().to_string(),
                scope,
                event_kind: EventKind::Join,
                window_ms: secs_to_ms(self.raid_window_secs),
                threshold: self.raid_threshold,
                action: ActionSpec::Composite(vec![
                    ActionSpec::ChannelLockdown {
                        slowmode_secs: Some(10),
                    },
                    ActionSpec::alert_staff("raid detected, public channels locked down"),
                ]),
                enabled: self.anti_raid_enabled,
                priority: None,
                cooldown_ms: Some(secs_to_ms(self.raid_window_secs).saturating_mul(5)),
                filter: EventFilter::Any,
            },
            anti_nuke_rule(
                scope,
                self.nuke_threshold,
                secs_to_ms(self.nuke_window_secs),
                self.anti_nuke_enabled,
            ),
            Rule {
                id: ProtectionModule::AntiLink.rule_id().to_string(),
                scope,
                event_kind: EventKind::Message,
                window_ms: 1000,
                threshold: 1,
                // Per-message, so only the poster hears about it
                action: ActionSpec::Composite(vec![
                    ActionSpec::DeleteMessage,
                    ActionSpec::tell_offender(
                        "posting invite or executable links is not allowed here",
                    ),
                ]),
                enabled: self.anti_link_enabled,
                priority: None,
                cooldown_ms: Some(0),
                filter: EventFilter::ContainsLink,
            },
            Rule {
                id: ProtectionModule::Impersonation.rule_id().to_string(),
                scope,
                event_kind: EventKind::NameChange,
                window_ms: 1000,
                threshold: 1,
                action: ActionSpec::Composite(vec![
                    ActionSpec::ResetNickname,
                    ActionSpec::tell_offender(
                        "your nickname was reset because it resembled a staff member",
                    ),
                    ActionSpec::alert_staff("nickname reset because it resembled staff"),
                ]),
                enabled: self.impersonation_enabled,
                priority: None,
                cooldown_ms: Some(0),
                filter: EventFilter::StaffLikeName,
            },
        ];

        rules.extend(self.custom_rules.iter().cloned().map(|mut rule| {
            rule.scope = scope;
            rule
        }));
        rules
    }
}

/// Seconds to milliseconds, saturating on oversized admin input.
pub fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

/// Millisecond span as a signed offset for timestamp math.
pub fn span_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Anti-nuke rule: revoke privileged roles after rapid destructive actions.
pub fn anti_nuke_rule(scope: GuildScope, threshold: u32, window_ms: u64, enabled: bool) -> Rule {
    Rule {
        id: ProtectionModule::AntiNuke.rule_id().to_string(),
        scope,
        event_kind: EventKind::DestructiveAction,
        window_ms,
        threshold,
        action: ActionSpec::Composite(vec![
            ActionSpec::RoleRevoke,
            ActionSpec::alert_staff("anti-nuke triggered, privileged roles revoked"),
        ]),
        enabled,
        priority: Some(-1),
        cooldown_ms: Some(window_ms.saturating_mul(6)),
        filter: EventFilter::Any,
    }
}

/// Process-wide engine tuning, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Distinct window keys kept in memory before new keys are refused
    pub max_window_keys: usize,
    pub config_ttl: Duration,
    /// Sweep interval; derived from the largest rule window when unset
    pub sweep_interval: Option<Duration>,
    /// Register the anti-nuke safety net as a global rule
    pub global_nuke_guard: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_window_keys: 100_000,
            config_ttl: Duration::from_secs(30),
            sweep_interval: None,
            global_nuke_guard: true,
        }
    }
}
