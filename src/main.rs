// This is the entry point of the Strive protection bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (databases)
// - `discord/` = Discord-specific adapters (commands, events, actions)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Set up the Discord framework
// 4. Register commands and event handlers

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use crate::core::protection::{EngineSettings, ProtectionService, TracingSink};
use crate::discord::protection::events as protection_events;
use crate::discord::protection::SerenityActionProvider;
use crate::discord::{Data, Error};
use crate::infra::protection::SqliteProtectionStore;
use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Event handler for non-command Discord events.
async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    protection_events::handle_event(ctx, event, data).await
}

/// Read an env var, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn engine_settings() -> anyhow::Result<EngineSettings> {
    let defaults = EngineSettings::default();
    let sweep_secs: Option<u64> = match std::env::var("PROTECTION_SWEEP_SECS") {
        Ok(_) => Some(env_or("PROTECTION_SWEEP_SECS", 0)?),
        Err(_) => None,
    };

    Ok(EngineSettings {
        max_window_keys: env_or("PROTECTION_MAX_KEYS", defaults.max_window_keys)?,
        config_ttl: Duration::from_secs(env_or(
            "PROTECTION_CONFIG_TTL_SECS",
            defaults.config_ttl.as_secs(),
        )?),
        sweep_interval: sweep_secs.map(Duration::from_secs),
        global_nuke_guard: env_or("PROTECTION_GLOBAL_NUKE_GUARD", defaults.global_nuke_guard)?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // Initialize logging so we can see what's happening. RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("DISCORD_TOKEN").context(
        "Missing DISCORD_TOKEN environment variable! Create a .env file with your bot token.",
    )?;
    let settings = engine_settings()?;
    tracing::info!(
        max_window_keys = settings.max_window_keys,
        config_ttl_secs = settings.config_ttl.as_secs(),
        global_nuke_guard = settings.global_nuke_guard,
        "Protection settings loaded"
    );

    // Keep runtime databases in a dedicated folder so the repo root stays tidy.
    let data_dir = std::env::var("STRIVE_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory for SQLite files")?;
    let protection_db_path = format!("{}/protection.db", data_dir);

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // The store is ready now; the action provider needs the client's HTTP and
    // cache handles, so the service itself is built in `setup`.

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", protection_db_path))
        .await
        .context("Failed to connect to protection DB")?;
    let protection_store = SqliteProtectionStore::new(pool);
    protection_store
        .migrate()
        .await
        .context("Failed to migrate protection DB")?;

    // ========================================================================
    // DISCORD FRAMEWORK SETUP
    // ========================================================================

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT // Required for link and keyword filters
        | serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MEMBERS
        | serenity::GatewayIntents::GUILD_MODERATION // Audit log entries for anti-nuke
        | serenity::GatewayIntents::GUILD_MESSAGE_REACTIONS;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![discord::protection::commands::protection()],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                tracing::info!("Bot is starting up...");

                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                tracing::info!("Commands registered");

                let provider = SerenityActionProvider::new(ctx.http.clone(), ctx.cache.clone());
                let protection = Arc::new(ProtectionService::new(
                    protection_store,
                    provider,
                    Arc::new(TracingSink),
                    settings,
                )?);

                // Background eviction of aged-out windows and expired mitigations
                protection.spawn_sweeper();

                tracing::info!("Bot is ready!");
                Ok(Data { protection })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .context("Error creating client")?;

    client.start().await.context("Error running bot")?;
    Ok(())
}
