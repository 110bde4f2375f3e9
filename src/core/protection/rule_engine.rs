// Rule engine - matches events against declarative rules.
//
// Rules are indexed by (scope, kind) so an event only touches the rules for
// its own guild and kind, plus the global ones. A guild rule with the same id
// as a global rule replaces it for that guild, so disabling it in the guild's
// config switches the global rule off there too.
//
// Guild indexes are rebuilt when the config revision changes. Window state is
// keyed by rule id, so rebuilding or disabling a rule never resets counts.

use super::protection_models::{span_ms, AbuseEvent, EventKind, GuildScope, Rule, Violation};
use super::sliding_window::{SlidingWindowCounter, WindowKey};
use super::ProtectionError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A rule with its resolved firing order.
#[derive(Debug, Clone)]
struct Ranked {
    order: i64,
    rule: Arc<Rule>,
}

/// Rules of one scope grouped by event kind, in firing order.
#[derive(Debug, Default)]
struct RuleIndex {
    by_kind: HashMap<EventKind, Vec<Ranked>>,
}

impl RuleIndex {
    fn build(rules: &[Rule]) -> Self {
        let mut by_kind: HashMap<EventKind, Vec<Ranked>> = HashMap::new();
        for (position, rule) in rules.iter().enumerate() {
            by_kind.entry(rule.event_kind).or_default().push(Ranked {
                order: rule.priority.map(i64::from).unwrap_or(position as i64),
                rule: Arc::new(rule.clone()),
            });
        }
        // Stable sort: equal priorities keep registration order
        for ranked in by_kind.values_mut() {
            ranked.sort_by_key(|r| r.order);
        }
        Self { by_kind }
    }

    fn rules_for(&self, kind: EventKind) -> &[Ranked] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn max_window_ms(&self) -> Option<u64> {
        self.by_kind
            .values()
            .flatten()
            .map(|r| r.rule.window_ms)
            .max()
    }
}

struct GuildRules {
    revision: u64,
    index: RuleIndex,
}

/// Result of evaluating one event.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub violations: Vec<Violation>,
    /// Rules skipped because the window map was full
    pub capacity_exceeded: Vec<String>,
}

pub struct RuleEngine {
    global: RwLock<RuleIndex>,
    guilds: DashMap<u64, GuildRules>,
    windows: SlidingWindowCounter,
}

impl RuleEngine {
    pub fn new(max_window_keys: usize) -> Self {
        Self {
            global: RwLock::new(RuleIndex::default()),
            guilds: DashMap::new(),
            windows: SlidingWindowCounter::new(max_window_keys),
        }
    }

    /// Replace the global rule set. Nothing changes if any rule is invalid.
    pub fn register_global(&self, rules: Vec<Rule>) -> Result<(), ProtectionError> {
        let rules: Vec<Rule> = rules
            .into_iter()
            .map(|mut rule| {
                rule.scope = GuildScope::Global;
                rule
            })
            .collect();
        for rule in &rules {
            rule.validate()?;
        }

        let index = RuleIndex::build(&rules);
        match self.global.write() {
            Ok(mut global) => *global = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
        Ok(())
    }

    /// Install a guild's rule set unless the same revision is already loaded.
    ///
    /// An invalid rule rejects the whole set and the previous one stays active.
    pub fn load_guild(
        &self,
        guild_id: u64,
        revision: u64,
        rules: &[Rule],
    ) -> Result<(), ProtectionError> {
        if self.loaded_revision(guild_id) == Some(revision) {
            return Ok(());
        }

        for rule in rules {
            rule.validate()?;
        }

        tracing::debug!(guild_id, revision, rules = rules.len(), "Rebuilding guild rule index");
        self.guilds.insert(
            guild_id,
            GuildRules {
                revision,
                index: RuleIndex::build(rules),
            },
        );
        Ok(())
    }

    pub fn loaded_revision(&self, guild_id: u64) -> Option<u64> {
        self.guilds.get(&guild_id).map(|g| g.revision)
    }

    /// Largest window across every loaded rule.
    pub fn max_window_ms(&self) -> Option<u64> {
        let global_max = self.read_global(RuleIndex::max_window_ms);
        let guild_max = self
            .guilds
            .iter()
            .filter_map(|g| g.index.max_window_ms())
            .max();
        global_max.into_iter().chain(guild_max).max()
    }

    /// Run an event through every applicable rule.
    pub fn evaluate(&self, event: &AbuseEvent) -> Evaluation {
        let candidates = self.candidates(event);
        let mut evaluation = Evaluation::default();

        for rule in candidates {
            // Disabled rules keep their history so re-enabling doesn't reset it
            if !rule.enabled || !rule.filter.matches(event) {
                continue;
            }

            let key = WindowKey::new(event.guild_id, event.subject_key, rule.id.as_str());
            let count = match self.windows.record(&key, rule.window_ms, event.timestamp_ms) {
                Ok(count) => count,
                Err(ProtectionError::CapacityExceeded { limit }) => {
                    tracing::warn!(
                        guild_id = event.guild_id,
                        subject_key = event.subject_key,
                        rule_id = %rule.id,
                        limit,
                        "Window capacity exceeded, skipping rule"
                    );
                    evaluation.capacity_exceeded.push(rule.id.clone());
                    continue;
                }
                Err(e) => {
                    tracing::error!(rule_id = %rule.id, "Window update failed: {}", e);
                    continue;
                }
            };

            if count >= rule.threshold as usize {
                evaluation.violations.push(Violation {
                    rule: (*rule).clone(),
                    subject_key: event.subject_key,
                    guild_id: event.guild_id,
                    triggering_count: count,
                    window_start: event.timestamp_ms.saturating_sub(span_ms(rule.window_ms)),
                    window_end: event.timestamp_ms,
                    metadata: event.metadata.clone(),
                });
            }
        }

        evaluation
    }

    /// Guild rules for the event kind plus global rules not overridden by id,
    /// merged into priority order.
    fn candidates(&self, event: &AbuseEvent) -> Vec<Arc<Rule>> {
        let mut ranked: Vec<Ranked> = self
            .guilds
            .get(&event.guild_id)
            .map(|g| g.index.rules_for(event.kind).to_vec())
            .unwrap_or_default();

        let global: Vec<Ranked> = self.read_global(|index| {
            index
                .rules_for(event.kind)
                .iter()
                .filter(|global| !ranked.iter().any(|r| r.rule.id == global.rule.id))
                .cloned()
                .collect()
        });

        if !global.is_empty() {
            ranked.extend(global);
            // Stable sort keeps guild rules ahead of global ones on ties
            ranked.sort_by_key(|r| r.order);
        }
        ranked.into_iter().map(|r| r.rule).collect()
    }

    fn read_global<T>(&self, f: impl FnOnce(&RuleIndex) -> T) -> T {
        match self.global.read() {
            Ok(global) => f(&global),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Drop a guild's rules and window state.
    pub fn purge_guild(&self, guild_id: u64) -> usize {
        self.guilds.remove(&guild_id);
        self.windows.purge_guild(guild_id)
    }

    /// Periodic eviction of aged-out windows.
    pub fn sweep(&self, now: i64) -> usize {
        self.windows.sweep(now)
    }

    pub fn windows(&self) -> &SlidingWindowCounter {
        &self.windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protection::{ActionSpec, EventFilter};

    fn rule(id: &str, scope: GuildScope, window_ms: u64, threshold: u32) -> Rule {
        Rule {
            id: id.to_string(),
            scope,
            event_kind: EventKind::Message,
            window_ms,
            threshold,
            action: ActionSpec::Mute { duration_ms: 600_000 },
            enabled: true,
            priority: None,
            cooldown_ms: None,
            filter: EventFilter::Any,
        }
    }

    fn message(user: u64, guild: u64, t: i64) -> AbuseEvent {
        AbuseEvent::new(user, guild, EventKind::Message, t)
    }

    #[test]
    fn test_threshold_boundary() {
        let engine = RuleEngine::new(1_000);
        engine
            .load_guild(1, 1, &[rule("spam", GuildScope::Guild(1), 10_000, 5)])
            .unwrap();

        for t in [0, 1_000, 2_000, 3_000] {
            assert!(engine.evaluate(&message(42, 1, t)).violations.is_empty());
        }

        let fifth = engine.evaluate(&message(42, 1, 4_000));
        assert_eq!(fifth.violations.len(), 1);
        let v = &fifth.violations[0];
        assert_eq!(v.triggering_count, 5);
        assert_eq!(v.window_start, -6_000);
        assert_eq!(v.window_end, 4_000);
    }

    #[test]
    fn test_guilds_count_independently() {
        let engine = RuleEngine::new(1_000);
        engine
            .register_global(vec![rule("spam", GuildScope::Global, 10_000, 3)])
            .unwrap();

        let mut fired = Vec::new();
        for t in 0..3 {
            for guild in [1, 2] {
                fired.push(engine.evaluate(&message(42, guild, t * 100)).violations.len());
            }
        }
        // Both guilds reach the threshold on their own third event
        assert_eq!(fired, vec![0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_multiple_rules_fire_in_priority_order() {
        let engine = RuleEngine::new(1_000);
        let mut first = rule("low", GuildScope::Guild(1), 1_000, 1);
        first.priority = Some(10);
        let mut second = rule("high", GuildScope::Guild(1), 1_000, 1);
        second.priority = Some(1);
        let third = rule("default", GuildScope::Guild(1), 1_000, 1);
        engine.load_guild(1, 1, &[first, second, third]).unwrap();

        let ids: Vec<String> = engine
            .evaluate(&message(1, 1, 0))
            .violations
            .into_iter()
            .map(|v| v.rule.id)
            .collect();
        // "default" sits at registration position 2
        assert_eq!(ids, vec!["high", "default", "low"]);
    }

    #[test]
    fn test_guild_rule_overrides_global_with_same_id() {
        let engine = RuleEngine::new(1_000);
        engine
            .register_global(vec![rule("spam", GuildScope::Global, 10_000, 1)])
            .unwrap();
        engine
            .load_guild(1, 1, &[rule("spam", GuildScope::Guild(1), 10_000, 3)])
            .unwrap();

        assert!(engine.evaluate(&message(5, 1, 0)).violations.is_empty());
        // Guild 2 has no override and uses the global threshold
        assert_eq!(engine.evaluate(&message(5, 2, 0)).violations.len(), 1);
    }

    #[test]
    fn test_disabled_guild_rule_switches_off_global() {
        let engine = RuleEngine::new(1_000);
        engine
            .register_global(vec![rule("spam", GuildScope::Global, 10_000, 1)])
            .unwrap();
        let mut local = rule("spam", GuildScope::Guild(1), 10_000, 3);
        local.enabled = false;
        engine.load_guild(1, 1, &[local]).unwrap();

        assert!(engine.evaluate(&message(5, 1, 0)).violations.is_empty());
        assert!(engine.windows().is_empty());
        // Other guilds keep the global rule
        assert_eq!(engine.evaluate(&message(5, 2, 0)).violations.len(), 1);
    }

    #[test]
    fn test_disabling_keeps_window_history() {
        let engine = RuleEngine::new(1_000);
        let mut r = rule("spam", GuildScope::Guild(1), 10_000, 3);
        engine.load_guild(1, 1, &[r.clone()]).unwrap();
        engine.evaluate(&message(7, 1, 0));
        engine.evaluate(&message(7, 1, 100));

        r.enabled = false;
        engine.load_guild(1, 2, &[r.clone()]).unwrap();
        assert!(engine.evaluate(&message(7, 1, 200)).violations.is_empty());

        r.enabled = true;
        engine.load_guild(1, 3, &[r]).unwrap();
        // Two earlier events are still counted
        assert_eq!(engine.evaluate(&message(7, 1, 300)).violations.len(), 1);
    }

    #[test]
    fn test_invalid_rule_keeps_previous_set() {
        let engine = RuleEngine::new(1_000);
        engine
            .load_guild(1, 1, &[rule("spam", GuildScope::Guild(1), 10_000, 1)])
            .unwrap();

        let err = engine
            .load_guild(1, 2, &[rule("broken", GuildScope::Guild(1), 0, 1)])
            .unwrap_err();
        assert!(matches!(err, ProtectionError::InvalidRule { .. }));
        assert_eq!(engine.loaded_revision(1), Some(1));
        assert_eq!(engine.evaluate(&message(1, 1, 0)).violations.len(), 1);
    }

    #[test]
    fn test_rules_only_see_their_event_kind() {
        let engine = RuleEngine::new(1_000);
        engine
            .load_guild(1, 1, &[rule("spam", GuildScope::Guild(1), 10_000, 1)])
            .unwrap();

        let join = AbuseEvent::new(1, 1, EventKind::Join, 0);
        assert!(engine.evaluate(&join).violations.is_empty());
        assert!(engine.windows().is_empty());
    }

    #[test]
    fn test_capacity_exceeded_fails_open() {
        let engine = RuleEngine::new(1);
        engine
            .load_guild(1, 1, &[rule("spam", GuildScope::Guild(1), 10_000, 1)])
            .unwrap();

        assert_eq!(engine.evaluate(&message(1, 1, 0)).violations.len(), 1);
        let second_user = engine.evaluate(&message(2, 1, 0));
        assert!(second_user.violations.is_empty());
        assert_eq!(second_user.capacity_exceeded, vec!["spam".to_string()]);
    }

    #[test]
    fn test_purge_guild_drops_rules_and_windows() {
        let engine = RuleEngine::new(1_000);
        engine
            .load_guild(1, 1, &[rule("spam", GuildScope::Guild(1), 10_000, 5)])
            .unwrap();
        engine.evaluate(&message(1, 1, 0));

        assert_eq!(engine.purge_guild(1), 1);
        assert_eq!(engine.loaded_revision(1), None);
        assert!(engine.windows().is_empty());
    }
}
