// Configuration store - read-through cache over per-guild protection settings.
//
// The persistence collaborator owns the data; this layer only caches it.
// On a store failure a cached value is served even if stale (fail static),
// and with nothing cached the caller gets `ConfigUnavailable`.

use super::protection_models::GuildProtectionConfig;
use super::{ProtectionError, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// STORAGE TRAIT (PORT)
// ============================================================================

/// Persistence for guild protection settings.
///
/// Following the same pattern as the other feature stores.
#[async_trait]
pub trait ProtectionConfigStore: Send + Sync {
    /// Stored config for a guild, `None` if the guild never configured anything.
    async fn load_guild_config(
        &self,
        guild_id: u64,
    ) -> Result<Option<GuildProtectionConfig>, StoreError>;

    async fn save_guild_config(&self, config: &GuildProtectionConfig) -> Result<(), StoreError>;

    async fn delete_guild_config(&self, guild_id: u64) -> Result<(), StoreError>;
}

// ============================================================================
// CACHE
// ============================================================================

struct CachedConfig {
    config: Arc<GuildProtectionConfig>,
    fetched_at: Instant,
}

pub struct CachedConfigStore<S: ProtectionConfigStore> {
    store: S,
    cache: DashMap<u64, CachedConfig>,
    ttl: Duration,
}

impl<S: ProtectionConfigStore> CachedConfigStore<S> {
    pub fn new(store: S, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Current config for a guild, refreshed from the store once the TTL lapses.
    pub async fn get(
        &self,
        guild_id: u64,
    ) -> Result<Arc<GuildProtectionConfig>, ProtectionError> {
        let cached = self
            .cache
            .get(&guild_id)
            .map(|entry| (Arc::clone(&entry.config), entry.fetched_at.elapsed() < self.ttl));

        if let Some((config, true)) = &cached {
            return Ok(Arc::clone(config));
        }

        match self.store.load_guild_config(guild_id).await {
            Ok(loaded) => {
                let config =
                    Arc::new(loaded.unwrap_or_else(|| GuildProtectionConfig::new(guild_id)));
                self.cache.insert(
                    guild_id,
                    CachedConfig {
                        config: Arc::clone(&config),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(config)
            }
            Err(e) => match cached {
                Some((stale, _)) => {
                    tracing::warn!(
                        guild_id,
                        "Protection config refresh failed, serving last known config: {}",
                        e
                    );
                    Ok(stale)
                }
                None => Err(ProtectionError::ConfigUnavailable {
                    guild_id,
                    source: e,
                }),
            },
        }
    }

    /// Drop the cached entry so the next `get` reads the store.
    pub fn invalidate(&self, guild_id: u64) {
        self.cache.remove(&guild_id);
    }

    /// Load, modify, validate and save a guild's config, bumping its revision.
    ///
    /// Reads the store directly so edits never build on a stale cache entry.
    pub async fn update<F>(
        &self,
        guild_id: u64,
        apply: F,
    ) -> Result<GuildProtectionConfig, ProtectionError>
    where
        F: FnOnce(&mut GuildProtectionConfig) + Send,
    {
        let mut config = self
            .store
            .load_guild_config(guild_id)
            .await?
            .unwrap_or_else(|| GuildProtectionConfig::new(guild_id));

        apply(&mut config);
        config.guild_id = guild_id;
        for rule in config.rules() {
            rule.validate()?;
        }
        // Zero is reserved for never-saved defaults
        config.revision = config.revision.wrapping_add(1).max(1);

        self.store.save_guild_config(&config).await?;
        self.invalidate(guild_id);
        Ok(config)
    }

    /// Forget a guild entirely: cache and persisted row.
    pub async fn purge_guild(&self, guild_id: u64) -> Result<(), ProtectionError> {
        self.invalidate(guild_id);
        self.store.delete_guild_config(guild_id).await?;
        Ok(())
    }

    pub fn cached_guilds(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub(crate) fn store_ref(&self) -> &S {
        &self.store
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::protection::{ActionSpec, EventFilter, EventKind, GuildScope, Rule};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory store for testing
    #[derive(Default)]
    pub(crate) struct MockConfigStore {
        pub configs: DashMap<u64, GuildProtectionConfig>,
        pub loads: AtomicUsize,
        pub offline: AtomicBool,
    }

    impl MockConfigStore {
        fn check_online(&self) -> Result<(), StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(StoreError::Database("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ProtectionConfigStore for MockConfigStore {
        async fn load_guild_config(
            &self,
            guild_id: u64,
        ) -> Result<Option<GuildProtectionConfig>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            Ok(self.configs.get(&guild_id).map(|c| c.clone()))
        }

        async fn save_guild_config(
            &self,
            config: &GuildProtectionConfig,
        ) -> Result<(), StoreError> {
            self.check_online()?;
            self.configs.insert(config.guild_id, config.clone());
            Ok(())
        }

        async fn delete_guild_config(&self, guild_id: u64) -> Result<(), StoreError> {
            self.check_online()?;
            self.configs.remove(&guild_id);
            Ok(())
        }
    }

    fn spam_enabled(guild_id: u64) -> GuildProtectionConfig {
        let mut config = GuildProtectionConfig::new(guild_id);
        config.anti_spam_enabled = true;
        config
    }

    #[tokio::test]
    async fn test_missing_config_defaults_to_disabled() {
        let cache = CachedConfigStore::new(MockConfigStore::default(), Duration::from_secs(30));
        let config = cache.get(1).await.unwrap();
        assert!(!config.any_enabled());
        assert_eq!(config.guild_id, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let store = MockConfigStore::default();
        store.configs.insert(1, spam_enabled(1));
        let cache = CachedConfigStore::new(store, Duration::from_secs(30));

        cache.get(1).await.unwrap();
        cache.get(1).await.unwrap();
        assert_eq!(cache.store.loads.load(Ordering::SeqCst), 1);

        cache.invalidate(1);
        cache.get(1).await.unwrap();
        assert_eq!(cache.store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_value_served_when_store_fails() {
        let store = MockConfigStore::default();
        store.configs.insert(1, spam_enabled(1));
        // Zero TTL: every get goes to the store
        let cache = CachedConfigStore::new(store, Duration::ZERO);

        assert!(cache.get(1).await.unwrap().anti_spam_enabled);

        cache.store.offline.store(true, Ordering::SeqCst);
        let config = cache.get(1).await.unwrap();
        assert!(config.anti_spam_enabled);
    }

    #[tokio::test]
    async fn test_config_unavailable_without_cache() {
        let store = MockConfigStore::default();
        store.offline.store(true, Ordering::SeqCst);
        let cache = CachedConfigStore::new(store, Duration::from_secs(30));

        let err = cache.get(3).await.unwrap_err();
        assert!(matches!(
            err,
            ProtectionError::ConfigUnavailable { guild_id: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_revision_and_invalidates() {
        let cache = CachedConfigStore::new(MockConfigStore::default(), Duration::from_secs(30));
        assert_eq!(cache.get(1).await.unwrap().revision, 0);

        let saved = cache
            .update(1, |c| c.anti_raid_enabled = true)
            .await
            .unwrap();
        assert_eq!(saved.revision, 1);

        let fresh = cache.get(1).await.unwrap();
        assert!(fresh.anti_raid_enabled);
        assert_eq!(fresh.revision, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_rules() {
        let store = MockConfigStore::default();
        store.configs.insert(1, spam_enabled(1));
        let cache = CachedConfigStore::new(store, Duration::from_secs(30));

        let err = cache
            .update(1, |c| {
                c.custom_rules.push(Rule {
                    id: "bad".to_string(),
                    scope: GuildScope::Guild(1),
                    event_kind: EventKind::Reaction,
                    window_ms: 1_000,
                    threshold: 0,
                    action: ActionSpec::DeleteMessage,
                    enabled: true,
                    priority: None,
                    cooldown_ms: None,
                    filter: EventFilter::Any,
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProtectionError::InvalidRule { .. }));
        // The stored config is untouched
        let stored = cache.store.configs.get(&1).unwrap().clone();
        assert!(stored.custom_rules.is_empty());
        assert_eq!(stored.revision, 0);
    }

    #[tokio::test]
    async fn test_purge_removes_row_and_cache() {
        let store = MockConfigStore::default();
        store.configs.insert(1, spam_enabled(1));
        let cache = CachedConfigStore::new(store, Duration::from_secs(30));
        cache.get(1).await.unwrap();

        cache.purge_guild(1).await.unwrap();
        assert_eq!(cache.cached_guilds(), 0);
        assert!(cache.store.configs.get(&1).is_none());
    }
}
