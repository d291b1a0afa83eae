use config::{Config, ConfigError, Environment};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{env, path::Path, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub sqlx_logging: bool,
}

/// Dispatch and retry policy of the sync job queue
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub jobs_per_interval: usize,
    pub interval_ms: u64,
    pub max_attempts: i32,
    pub retry_base_delay_ms: u64,
    pub idle_poll_ms: u64,
    pub stale_after_secs: u64,
    pub backoff_secs: u64,
}

impl QueueConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            jobs_per_interval: 1,
            interval_ms: 1_000,
            max_attempts: 5,
            retry_base_delay_ms: 5_000,
            idle_poll_ms: 500,
            stale_after_secs: 300,
            backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    pub lookback_days: i64,
    pub page_size: u32,
    pub max_messages: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            page_size: 100,
            max_messages: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    pub id: String,
    pub temperature: f64,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GmailConfig {
    #[serde(default = "default_gmail_api_base")]
    pub api_base: String,
    pub token_uri: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

fn default_gmail_api_base() -> String {
    "https://www.googleapis.com/gmail/v1/users/me".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    pub verification_token: Option<String>,
}

/// Key for OAuth tokens at rest, normally set with `SORTER__CRYPTO__TOKEN_KEY`
#[derive(Clone, Default, Deserialize)]
pub struct CryptoConfig {
    #[serde(default)]
    pub token_key: String,
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("token_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    pub log_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub backfill: BackfillConfig,
    pub model: ModelConfig,
    pub gmail: GmailConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    pub status: StatusConfig,
}

impl ServerConfig {
    /// Reads `config.toml` from `root`, then applies `SORTER__SECTION__KEY` overrides.
    pub fn load(root: &str) -> Result<Self, ConfigError> {
        let path = format!("{root}/config.toml");
        Config::builder()
            .add_source(config::File::with_name(&path))
            .add_source(
                Environment::with_prefix("SORTER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

// Secrets are left out on purpose, this is printed at start-up.
impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\nPort: {}\n\nQueue: {:?}\n\nBackfill: {:?}\n\nModel: {} @ {} (temperature {})\n\nGmail token uri: {}\n\nWebhook token configured: {}\n\nToken key configured: {}\n\nStatus log every {}s",
            self.server.port,
            self.queue,
            self.backfill,
            self.model.id,
            self.model.endpoint,
            self.model.temperature,
            self.gmail.token_uri,
            self.webhook.verification_token.is_some(),
            !self.crypto.token_key.is_empty(),
            self.status.log_interval_secs,
        )
    }
}

pub fn config_root() -> String {
    env::var("APP_DIR").unwrap_or_else(|_| {
        let parent_dir = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        format!("{}/config", parent_dir)
    })
}

lazy_static! {
    pub static ref cfg: ServerConfig =
        ServerConfig::load(&config_root()).expect("config.toml is missing or invalid");
}
