// SQLite-backed protection config store.
//
// Tables:
// - protection_config: Per-guild module toggles, thresholds and custom rules
//
// Custom rules are stored as a JSON array so new rule fields don't need
// a schema change.

use crate::core::protection::{GuildProtectionConfig, ProtectionConfigStore, Rule, StoreError};
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteProtectionStore {
    pool: Pool<Sqlite>,
}

impl SqliteProtectionStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS protection_config (
                guild_id INTEGER PRIMARY KEY,
                anti_spam_enabled BOOLEAN NOT NULL DEFAULT 0,
                anti_raid_enabled BOOLEAN NOT NULL DEFAULT 0,
                anti_nuke_enabled BOOLEAN NOT NULL DEFAULT 0,
                anti_link_enabled BOOLEAN NOT NULL DEFAULT 0,
                impersonation_enabled BOOLEAN NOT NULL DEFAULT 0,
                spam_threshold INTEGER NOT NULL DEFAULT 5,
                spam_window_secs INTEGER NOT NULL DEFAULT 10,
                raid_threshold INTEGER NOT NULL DEFAULT 10,
                raid_window_secs INTEGER NOT NULL DEFAULT 60,
                nuke_threshold INTEGER NOT NULL DEFAULT 3,
                nuke_window_secs INTEGER NOT NULL DEFAULT 10,
                mute_duration_secs INTEGER NOT NULL DEFAULT 600,
                alert_channel_id INTEGER,
                custom_rules TEXT NOT NULL DEFAULT '[]',
                revision INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ProtectionConfigStore for SqliteProtectionStore {
    async fn load_guild_config(
        &self,
        guild_id: u64,
    ) -> Result<Option<GuildProtectionConfig>, StoreError> {
        let row = sqlx::query("SELECT * FROM protection_config WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let rules_json: String = row.get("custom_rules");
        let custom_rules: Vec<Rule> = serde_json::from_str(&rules_json).map_err(|e| {
            StoreError::Corrupt(format!("custom rules for guild {}: {}", guild_id, e))
        })?;

        Ok(Some(GuildProtectionConfig {
            guild_id,
            anti_spam_enabled: row.get("anti_spam_enabled"),
            anti_raid_enabled: row.get("anti_raid_enabled"),
            anti_nuke_enabled: row.get("anti_nuke_enabled"),
            anti_link_enabled: row.get("anti_link_enabled"),
            impersonation_enabled: row.get("impersonation_enabled"),
            spam_threshold: row.get::<i32, _>("spam_threshold") as u32,
            spam_window_secs: row.get::<i64, _>("spam_window_secs") as u64,
            raid_threshold: row.get::<i32, _>("raid_threshold") as u32,
            raid_window_secs: row.get::<i64, _>("raid_window_secs") as u64,
            nuke_threshold: row.get::<i32, _>("nuke_threshold") as u32,
            nuke_window_secs: row.get::<i64, _>("nuke_window_secs") as u64,
            mute_duration_secs: row.get::<i64, _>("mute_duration_secs") as u64,
            alert_channel_id: row
                .get::<Option<i64>, _>("alert_channel_id")
                .map(|id| id as u64),
            custom_rules,
            revision: row.get::<i64, _>("revision") as u64,
        }))
    }

    async fn save_guild_config(&self, config: &GuildProtectionConfig) -> Result<(), StoreError> {
        let rules_json = serde_json::to_string(&config.custom_rules)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO protection_config (
                guild_id, anti_spam_enabled, anti_raid_enabled, anti_nuke_enabled,
                anti_link_enabled, impersonation_enabled, spam_threshold, spam_window_secs,
                raid_threshold, raid_window_secs, nuke_threshold, nuke_window_secs,
                mute_duration_secs, alert_channel_id, custom_rules, revision
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(guild_id) DO UPDATE SET
                anti_spam_enabled = excluded.anti_spam_enabled,
                anti_raid_enabled = excluded.anti_raid_enabled,
                anti_nuke_enabled = excluded.anti_nuke_enabled,
                anti_link_enabled = excluded.anti_link_enabled,
                impersonation_enabled = excluded.impersonation_enabled,
                spam_threshold = excluded.spam_threshold,
                spam_window_secs = excluded.spam_window_secs,
                raid_threshold = excluded.raid_threshold,
                raid_window_secs = excluded.raid_window_secs,
                nuke_threshold = excluded.nuke_threshold,
                nuke_window_secs = excluded.nuke_window_secs,
                mute_duration_secs = excluded.mute_duration_secs,
                alert_channel_id = excluded.alert_channel_id,
                custom_rules = excluded.custom_rules,
                revision = excluded.revision
            "#,
        )
        .bind(config.guild_id as i64)
        .bind(config.anti_spam_enabled)
        .bind(config.anti_raid_enabled)
        .bind(config.anti_nuke_enabled)
        .bind(config.anti_link_enabled)
        .bind(config.impersonation_enabled)
        .bind(config.spam_threshold as i32)
        .bind(config.spam_window_secs as i64)
        .bind(config.raid_threshold as i32)
        .bind(config.raid_window_secs as i64)
        .bind(config.nuke_threshold as i32)
        .bind(config.nuke_window_secs as i64)
        .bind(config.mute_duration_secs as i64)
        .bind(config.alert_channel_id.map(|id| id as i64))
        .bind(rules_json)
        .bind(config.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_guild_config(&self, guild_id: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM protection_config WHERE guild_id = ?")
            .bind(guild_id as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protection::{ActionSpec, EventFilter, EventKind, GuildScope};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> (SqliteProtectionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protection.db");
        let pool = SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .unwrap();
        let store = SqliteProtectionStore::new(pool);
        store.migrate().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_missing_guild_returns_none() {
        let (store, _dir) = store().await;
        assert!(store.load_guild_config(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_persistence() {
        let (store, _dir) = store().await;

        let mut config = GuildProtectionConfig::new(123_456_789_012_345_678);
        config.anti_spam_enabled = true;
        config.anti_nuke_enabled = true;
        config.spam_threshold = 8;
        config.alert_channel_id = Some(987_654_321_098_765_432);
        config.revision = 4;
        config.custom_rules.push(Rule {
            id: "mention_flood".to_string(),
            scope: GuildScope::Guild(config.guild_id),
            event_kind: EventKind::Message,
            window_ms: 30_000,
            threshold: 2,
            action: ActionSpec::Composite(vec![
                ActionSpec::DeleteMessage,
                ActionSpec::Mute { duration_ms: 60_000 },
            ]),
            enabled: true,
            priority: Some(3),
            cooldown_ms: None,
            filter: EventFilter::MinMentions(10),
        });

        store.save_guild_config(&config).await.unwrap();
        let loaded = store.load_guild_config(config.guild_id).await.unwrap();
        assert_eq!(loaded, Some(config.clone()));

        // Upsert overwrites
        config.anti_spam_enabled = false;
        config.revision = 5;
        store.save_guild_config(&config).await.unwrap();
        let loaded = store.load_guild_config(config.guild_id).await.unwrap().unwrap();
        assert!(!loaded.anti_spam_enabled);
        assert_eq!(loaded.revision, 5);

        store.delete_guild_config(config.guild_id).await.unwrap();
        assert!(store.load_guild_config(config.guild_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_rules_are_reported() {
        let (store, _dir) = store().await;
        sqlx::query("INSERT INTO protection_config (guild_id, custom_rules) VALUES (?, ?)")
            .bind(1i64)
            .bind("not json")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.load_guild_config(1).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
