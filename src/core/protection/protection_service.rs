// Protection service - the engine's entry point.
//
// This service handles:
// - Evaluating normalized events against guild and global rules
// - Dispatching mitigations for the resulting violations
// - Guild config edits (modules, thresholds, custom rules)
// - Periodic sweeps and guild purges
//
// NO Discord dependencies here - actions go through `ActionProvider`.

use super::config_store::{CachedConfigStore, ProtectionConfigStore};
use super::dispatcher::{ActionProvider, MitigationDispatcher};
use super::observability::{self, ObservabilitySink, SecurityEvent};
use super::protection_models::{
    anti_nuke_rule, secs_to_ms, AbuseEvent, EngineSettings, EventKind, GuildProtectionConfig,
    GuildScope, MitigationOutcome, MitigationRecord, ProtectionModule, Rule,
};
use super::rule_engine::RuleEngine;
use super::ProtectionError;
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shortest interval the background sweeper will run at.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Sweep interval when no rule is loaded yet.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventReport {
    pub guild_id: u64,
    pub subject_key: u64,
    pub kind: EventKind,
    /// (rule id, outcome) for every violation, in firing order
    pub outcomes: Vec<(String, MitigationOutcome)>,
    /// Rules skipped because the window map was full
    pub capacity_exceeded: Vec<String>,
}

impl EventReport {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == MitigationOutcome::Applied)
            .count()
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub windows: usize,
    pub tracked_events: usize,
    pub records: usize,
    pub queues: usize,
    pub cached_configs: usize,
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub windows: usize,
    pub records: usize,
}

pub struct ProtectionService<S: ProtectionConfigStore, P: ActionProvider> {
    configs: CachedConfigStore<S>,
    engine: RuleEngine,
    dispatcher: MitigationDispatcher<P>,
    sink: Arc<dyn ObservabilitySink>,
    settings: EngineSettings,
}

impl<S: ProtectionConfigStore, P: ActionProvider> ProtectionService<S, P> {
    /// Create the service. With `global_nuke_guard` set, an anti-nuke rule with
    /// default thresholds is registered for every guild.
    pub fn new(
        store: S,
        provider: P,
        sink: Arc<dyn ObservabilitySink>,
        settings: EngineSettings,
    ) -> Result<Self, ProtectionError> {
        let service = Self {
            configs: CachedConfigStore::new(store, settings.config_ttl),
            engine: RuleEngine::new(settings.max_window_keys),
            dispatcher: MitigationDispatcher::new(provider, Arc::clone(&sink)),
            sink,
            settings,
        };

        if service.settings.global_nuke_guard {
            let defaults = GuildProtectionConfig::new(0);
            service.engine.register_global(vec![anti_nuke_rule(
                GuildScope::Global,
                defaults.nuke_threshold,
                secs_to_ms(defaults.nuke_window_secs),
                true,
            )])?;
        }

        Ok(service)
    }

    // ========================================================================
    // EVENT HANDLING
    // ========================================================================

    /// Evaluate an event and run mitigations for every violation it causes.
    ///
    /// Without a usable config the guild is treated as unprotected and
    /// `ConfigUnavailable` is returned.
    ///
    /// Events for one subject are dispatched in the order they are evaluated.
    /// Two events that both wait on a config reload can be evaluated in either
    /// order.
    pub async fn handle_event(
        &self,
        mut event: AbuseEvent,
    ) -> Result<EventReport, ProtectionError> {
        let config = match self.configs.get(event.guild_id).await {
            Ok(config) => config,
            Err(e) => {
                self.sink.emit(
                    SecurityEvent::new(observability::CONFIG_UNAVAILABLE)
                        .field("guild_id", event.guild_id)
                        .field("error", &e),
                );
                return Err(e);
            }
        };

        if self.engine.loaded_revision(event.guild_id) != Some(config.revision) {
            // Never-configured guilds install nothing, so global rules apply as-is
            let rules = if config.is_stored() {
                config.rules()
            } else {
                Vec::new()
            };
            if let Err(e) = self
                .engine
                .load_guild(event.guild_id, config.revision, &rules)
            {
                tracing::warn!(
                    guild_id = event.guild_id,
                    revision = config.revision,
                    "Rejected guild rule set, keeping previous: {}",
                    e
                );
            }
        }

        if let Some(channel_id) = config.alert_channel_id {
            event
                .metadata
                .insert("alert_channel_id".to_string(), channel_id.into());
        }

        let evaluation = self.engine.evaluate(&event);

        for rule_id in &evaluation.capacity_exceeded {
            self.sink.emit(
                SecurityEvent::new(observability::CAPACITY_EXCEEDED)
                    .field("guild_id", event.guild_id)
                    .field("subject_key", event.subject_key)
                    .field("rule_id", rule_id)
                    .field("limit", self.engine.windows().max_keys()),
            );
        }

        // Submit everything before awaiting so the subject's queue sees
        // violations in evaluation order
        let mut pending = Vec::with_capacity(evaluation.violations.len());
        for violation in evaluation.violations {
            self.sink.emit(
                SecurityEvent::new(observability::VIOLATION)
                    .field("guild_id", violation.guild_id)
                    .field("subject_key", violation.subject_key)
                    .field("rule_id", &violation.rule.id)
                    .field("kind", violation.rule.event_kind)
                    .field("count", violation.triggering_count)
                    .field("window_start", violation.window_start)
                    .field("window_end", violation.window_end),
            );
            let rule_id = violation.rule.id.clone();
            pending.push((rule_id, self.dispatcher.submit(violation)));
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for (rule_id, mitigation) in pending {
            outcomes.push((rule_id, mitigation.outcome().await));
        }

        Ok(EventReport {
            guild_id: event.guild_id,
            subject_key: event.subject_key,
            kind: event.kind,
            outcomes,
            capacity_exceeded: evaluation.capacity_exceeded,
        })
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Drop every trace of a guild: windows, records, queued work, config.
    ///
    /// In-memory state is cleared even when deleting the stored config fails.
    pub async fn purge_guild(&self, guild_id: u64) -> Result<(), ProtectionError> {
        let windows = self.engine.purge_guild(guild_id);
        let records = self.dispatcher.purge_guild(guild_id);
        let stored = self.configs.purge_guild(guild_id).await;

        self.sink.emit(
            SecurityEvent::new(observability::GUILD_DATA_PURGED)
                .field("guild_id", guild_id)
                .field("windows", windows)
                .field("records", records)
                .field("config_deleted", stored.is_ok()),
        );
        stored
    }

    /// Evict aged-out windows, expired records and idle queues.
    pub fn sweep(&self, now: i64) -> SweepReport {
        SweepReport {
            windows: self.engine.sweep(now),
            records: self.dispatcher.sweep(now),
        }
    }

    /// Configured interval, else the largest loaded rule window.
    pub fn sweep_interval(&self) -> Duration {
        if let Some(interval) = self.settings.sweep_interval {
            return interval.max(MIN_SWEEP_INTERVAL);
        }
        self.engine
            .max_window_ms()
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL)
            .max(MIN_SWEEP_INTERVAL)
    }

    /// Run `sweep` in the background until the service is dropped.
    ///
    /// The interval is re-read every pass so newly loaded guild rules with
    /// longer windows are picked up.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
    {
        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let interval = match service.upgrade() {
                    Some(service) => service.sweep_interval(),
                    None => break,
                };
                tokio::time::sleep(interval).await;

                let Some(service) = service.upgrade() else {
                    break;
                };
                let report = service.sweep(Utc::now().timestamp_millis());
                tracing::debug!(
                    windows = report.windows,
                    records = report.records,
                    tracked = service.tracked_windows(),
                    "Protection sweep finished"
                );
            }
            tracing::debug!("Protection service dropped, stopping sweeper");
        })
    }

    // ========================================================================
    // CONFIGURATION
    // ========================================================================

    pub async fn config(
        &self,
        guild_id: u64,
    ) -> Result<Arc<GuildProtectionConfig>, ProtectionError> {
        self.configs.get(guild_id).await
    }

    pub async fn update_config<F>(
        &self,
        guild_id: u64,
        apply: F,
    ) -> Result<GuildProtectionConfig, ProtectionError>
    where
        F: FnOnce(&mut GuildProtectionConfig) + Send,
    {
        let config = self.configs.update(guild_id, apply).await?;
        tracing::info!(guild_id, revision = config.revision, "Protection config updated");
        Ok(config)
    }

    pub async fn set_module_enabled(
        &self,
        guild_id: u64,
        module: ProtectionModule,
        enabled: bool,
    ) -> Result<GuildProtectionConfig, ProtectionError> {
        self.update_config(guild_id, |config| config.set_enabled(module, enabled))
            .await
    }

    /// Add a custom rule, replacing any custom rule with the same id.
    pub async fn add_rule(
        &self,
        guild_id: u64,
        mut rule: Rule,
    ) -> Result<GuildProtectionConfig, ProtectionError> {
        if ProtectionModule::ALL.iter().any(|m| m.rule_id() == rule.id) {
            return Err(ProtectionError::InvalidRule {
                rule_id: rule.id,
                reason: "id is reserved for a built-in module".to_string(),
            });
        }
        rule.scope = GuildScope::Guild(guild_id);
        rule.validate()?;

        self.update_config(guild_id, move |config| {
            config.custom_rules.retain(|r| r.id != rule.id);
            config.custom_rules.push(rule);
        })
        .await
    }

    /// Remove a custom rule. Returns false when no rule had that id.
    pub async fn remove_rule(&self, guild_id: u64, rule_id: &str) -> Result<bool, ProtectionError> {
        let current = self.configs.get(guild_id).await?;
        if !current.custom_rules.iter().any(|r| r.id == rule_id) {
            return Ok(false);
        }

        let rule_id = rule_id.to_string();
        self.update_config(guild_id, move |config| {
            config.custom_rules.retain(|r| r.id != rule_id);
        })
        .await?;
        Ok(true)
    }

    /// Lift active mitigations for a subject so its rules can fire again.
    pub fn pardon(&self, guild_id: u64, subject_key: u64, rule_id: Option<&str>) -> usize {
        let cleared = match rule_id {
            Some(rule_id) => {
                usize::from(self.dispatcher.clear_record(guild_id, subject_key, rule_id))
            }
            None => self.dispatcher.clear_subject(guild_id, subject_key),
        };
        tracing::info!(guild_id, subject_key, cleared, "Pardoned subject");
        cleared
    }

    pub fn active_mitigations(&self, guild_id: u64) -> Vec<MitigationRecord> {
        self.dispatcher
            .active_records(guild_id, Utc::now().timestamp_millis())
    }

    pub fn stats(&self) -> EngineStats {
        let windows = self.engine.windows();
        EngineStats {
            windows: windows.len(),
            tracked_events: windows.tracked_events(),
            records: self.dispatcher.record_count(),
            queues: self.dispatcher.queue_count(),
            cached_configs: self.configs.cached_guilds(),
        }
    }

    /// Window keys currently held in memory.
    pub fn tracked_windows(&self) -> usize {
        self.engine.windows().len()
    }

    pub fn provider(&self) -> &P {
        self.dispatcher.provider()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protection::config_store::tests::MockConfigStore;
    use crate::core::protection::dispatcher::tests::MockProvider;
    use crate::core::protection::observability::testing::RecordingSink;
    use crate::core::protection::{ActionSpec, EventFilter};
    use std::sync::atomic::Ordering;

    type TestService = ProtectionService<MockConfigStore, MockProvider>;

    fn service_with(
        store: MockConfigStore,
        settings: EngineSettings,
    ) -> (TestService, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let service =
            ProtectionService::new(store, MockProvider::default(), sink.clone(), settings).unwrap();
        (service, sink)
    }

    fn spam_guild(guild_id: u64) -> GuildProtectionConfig {
        let mut config = GuildProtectionConfig::new(guild_id);
        config.anti_spam_enabled = true;
        config.revision = 1;
        config
    }

    fn service(guilds: &[u64]) -> (TestService, Arc<RecordingSink>) {
        let store = MockConfigStore::default();
        for guild in guilds {
            store.configs.insert(*guild, spam_guild(*guild));
        }
        service_with(
            store,
            EngineSettings {
                global_nuke_guard: false,
                ..EngineSettings::default()
            },
        )
    }

    fn message(subject: u64, guild: u64, at: i64) -> AbuseEvent {
        AbuseEvent::new(subject, guild, EventKind::Message, at)
    }

    #[tokio::test]
    async fn test_spam_burst_mutes_once() {
        let (service, sink) = service(&[1]);

        let mut reports = Vec::new();
        for i in 0..6 {
            reports.push(service.handle_event(message(42, 1, i * 1_000)).await.unwrap());
        }

        assert!(reports[..4].iter().all(|r| r.outcomes.is_empty()));
        assert_eq!(
            reports[4].outcomes,
            vec![("anti_spam".to_string(), MitigationOutcome::Applied)]
        );
        assert_eq!(
            reports[5].outcomes,
            vec![("anti_spam".to_string(), MitigationOutcome::Suppressed)]
        );
        assert_eq!(
            service.provider().calls(),
            vec!["mute:42:600:0", "warn:42", "notify:42"]
        );
        assert_eq!(sink.count(observability::VIOLATION), 2);
    }

    #[tokio::test]
    async fn test_guilds_are_isolated() {
        let (service, _) = service(&[1, 2]);

        for i in 0..4 {
            service.handle_event(message(42, 1, i)).await.unwrap();
        }
        // Same user, other guild: no shared window
        let report = service.handle_event(message(42, 2, 5)).await.unwrap();
        assert!(report.outcomes.is_empty());

        let report = service.handle_event(message(42, 1, 5)).await.unwrap();
        assert_eq!(report.applied(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_guild_takes_no_action() {
        let (service, _) = service(&[]);
        for i in 0..10 {
            let report = service.handle_event(message(42, 9, i)).await.unwrap();
            assert!(report.outcomes.is_empty());
        }
        assert!(service.provider().calls().is_empty());
    }

    #[tokio::test]
    async fn test_config_unavailable_skips_guild() {
        let (service, sink) = service(&[1]);
        service.configs.store_ref().offline.store(true, Ordering::SeqCst);

        let err = service.handle_event(message(42, 1, 0)).await.unwrap_err();
        assert!(matches!(err, ProtectionError::ConfigUnavailable { guild_id: 1, .. }));
        assert_eq!(sink.count(observability::CONFIG_UNAVAILABLE), 1);
        assert!(service.provider().calls().is_empty());
    }

    #[tokio::test]
    async fn test_global_nuke_guard_covers_unconfigured_guilds() {
        let (service, _) = service_with(MockConfigStore::default(), EngineSettings::default());

        let mut last = None;
        for i in 0..3 {
            let event = AbuseEvent::new(13, 4, EventKind::DestructiveAction, i * 1_000);
            last = Some(service.handle_event(event).await.unwrap());
        }

        assert_eq!(
            last.unwrap().outcomes,
            vec![("anti_nuke".to_string(), MitigationOutcome::Applied)]
        );
        assert_eq!(service.provider().calls(), vec!["revoke:13", "notify:13"]);
    }

    #[tokio::test]
    async fn test_disabling_anti_nuke_switches_off_global_guard() {
        let (service, _) = service_with(MockConfigStore::default(), EngineSettings::default());
        service
            .set_module_enabled(4, ProtectionModule::AntiSpam, true)
            .await
            .unwrap();
        service
            .set_module_enabled(4, ProtectionModule::AntiNuke, false)
            .await
            .unwrap();

        for i in 0..3 {
            let event = AbuseEvent::new(13, 4, EventKind::DestructiveAction, i * 1_000);
            let report = service.handle_event(event).await.unwrap();
            assert!(report.outcomes.is_empty());
        }
        assert!(service.provider().calls().is_empty());

        // A guild that never saved settings is still covered
        let mut last = None;
        for i in 0..3 {
            let event = AbuseEvent::new(13, 5, EventKind::DestructiveAction, i * 1_000);
            last = Some(service.handle_event(event).await.unwrap());
        }
        assert_eq!(last.unwrap().applied(), 1);
    }

    #[tokio::test]
    async fn test_link_warning_goes_to_poster_only() {
        let store = MockConfigStore::default();
        let mut config = GuildProtectionConfig::new(1);
        config.anti_link_enabled = true;
        config.revision = 1;
        store.configs.insert(1, config);
        let (service, _) = service_with(
            store,
            EngineSettings {
                global_nuke_guard: false,
                ..EngineSettings::default()
            },
        );

        for i in 0..2 {
            let event = message(5, 1, i).with_meta("content", "join discord.gg/raidcrew");
            assert_eq!(service.handle_event(event).await.unwrap().applied(), 1);
        }
        // Every link is removed, staff are never paged
        assert_eq!(
            service.provider().calls(),
            vec!["delete:5", "warn:5", "delete:5", "warn:5"]
        );
    }

    #[tokio::test]
    async fn test_capacity_exceeded_reaches_sink() {
        let store = MockConfigStore::default();
        store.configs.insert(1, spam_guild(1));
        let (service, sink) = service_with(
            store,
            EngineSettings {
                max_window_keys: 1,
                global_nuke_guard: false,
                ..EngineSettings::default()
            },
        );

        service.handle_event(message(1, 1, 0)).await.unwrap();
        let report = service.handle_event(message(2, 1, 0)).await.unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(report.capacity_exceeded, vec!["anti_spam".to_string()]);
        assert_eq!(sink.count(observability::CAPACITY_EXCEEDED), 1);
        assert_eq!(service.stats().windows, 1);
    }

    #[tokio::test]
    async fn test_config_change_takes_effect_without_restart() {
        let (service, _) = service(&[]);
        for i in 0..5 {
            service.handle_event(message(42, 1, i)).await.unwrap();
        }
        assert!(service.provider().calls().is_empty());

        service
            .set_module_enabled(1, ProtectionModule::AntiSpam, true)
            .await
            .unwrap();
        let mut applied = 0;
        for i in 10..15 {
            applied += service.handle_event(message(42, 1, i)).await.unwrap().applied();
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_custom_rules() {
        let (service, _) = service(&[]);
        let rule = Rule {
            id: "scam_words".to_string(),
            scope: GuildScope::Global,
            event_kind: EventKind::Message,
            window_ms: 60_000,
            threshold: 1,
            action: ActionSpec::DeleteMessage,
            enabled: true,
            priority: None,
            cooldown_ms: Some(0),
            filter: EventFilter::ContainsKeyword(vec!["free nitro".to_string()]),
        };

        let config = service.add_rule(1, rule.clone()).await.unwrap();
        assert_eq!(config.custom_rules[0].scope, GuildScope::Guild(1));

        let clean = service
            .handle_event(message(5, 1, 0).with_meta("content", "hi"))
            .await
            .unwrap();
        assert!(clean.outcomes.is_empty());
        let scam = service
            .handle_event(message(5, 1, 10).with_meta("content", "FREE NITRO here"))
            .await
            .unwrap();
        assert_eq!(scam.applied(), 1);

        let mut reserved = rule;
        reserved.id = "anti_spam".to_string();
        assert!(matches!(
            service.add_rule(1, reserved).await,
            Err(ProtectionError::InvalidRule { .. })
        ));

        assert!(service.remove_rule(1, "scam_words").await.unwrap());
        assert!(!service.remove_rule(1, "scam_words").await.unwrap());
    }

    #[tokio::test]
    async fn test_pardon_allows_refire() {
        let (service, _) = service(&[1]);
        for i in 0..5 {
            service.handle_event(message(42, 1, i)).await.unwrap();
        }
        assert_eq!(service.pardon(1, 42, None), 1);

        let report = service.handle_event(message(42, 1, 6)).await.unwrap();
        assert_eq!(report.applied(), 1);
    }

    #[tokio::test]
    async fn test_purge_guild_clears_everything() {
        let (service, sink) = service(&[1, 2]);
        for i in 0..5 {
            service.handle_event(message(42, 1, i)).await.unwrap();
            service.handle_event(message(42, 2, i)).await.unwrap();
        }

        service.purge_guild(1).await.unwrap();
        assert_eq!(sink.count(observability::GUILD_DATA_PURGED), 1);
        assert!(service.configs.store_ref().configs.get(&1).is_none());
        assert!(service.active_mitigations(1).is_empty());
        // Guild 2 keeps its windows
        assert_eq!(service.tracked_windows(), 1);

        // A returning guild starts from defaults: nothing enabled
        let report = service.handle_event(message(42, 1, 10)).await.unwrap();
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_aged_windows() {
        let (service, _) = service(&[1]);
        service.handle_event(message(42, 1, 0)).await.unwrap();
        assert_eq!(service.tracked_windows(), 1);

        let report = service.sweep(60_000);
        assert_eq!(report.windows, 1);
        assert_eq!(service.tracked_windows(), 0);
    }

    #[tokio::test]
    async fn test_sweep_interval_follows_largest_window() {
        let store = MockConfigStore::default();
        let mut config = spam_guild(1);
        config.raid_window_secs = 300;
        store.configs.insert(1, config);
        let (service, _) = service_with(
            store,
            EngineSettings {
                global_nuke_guard: false,
                ..EngineSettings::default()
            },
        );
        assert_eq!(service.sweep_interval(), DEFAULT_SWEEP_INTERVAL);

        service.handle_event(message(42, 1, 0)).await.unwrap();
        assert_eq!(service.sweep_interval(), Duration::from_secs(300));

        let (fixed, _) = service_with(
            MockConfigStore::default(),
            EngineSettings {
                sweep_interval: Some(Duration::from_millis(10)),
                ..EngineSettings::default()
            },
        );
        assert_eq!(fixed.sweep_interval(), MIN_SWEEP_INTERVAL);
    }
}
