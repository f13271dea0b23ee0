//! Dripcast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DripError, Result};

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "bot_database.db";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DripConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub welcome: WelcomeConfig,
}

impl DripConfig {
    /// Load config from `$DATA_DIR/config.toml` if it exists, else defaults.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.toml");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DripError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| DripError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Secrets may come from the environment instead of the file.
    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN")
            && !token.is_empty()
        {
            self.telegram.bot_token = token;
        }
        if let Ok(token) = std::env::var("DRIPCAST_ADMIN_TOKEN")
            && !token.is_empty()
        {
            self.gateway.admin_token = token;
        }
    }

    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.tick_secs == 0 || self.dispatcher.tick_secs > 60 {
            return Err(DripError::Config(format!(
                "dispatcher.tick_secs must be within 1..=60 (got {})",
                self.dispatcher.tick_secs
            )));
        }
        if self.store.pool_size == 0 {
            return Err(DripError::Config("store.pool_size must be > 0".into()));
        }
        if self.expiry.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(DripError::Config(
                "expiry.utc_offset_minutes must be within one day".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the storage root: `DATA_DIR`, else `/data` if present, else `./data`.
    pub fn data_dir() -> PathBuf {
        resolve_data_dir(std::env::var("DATA_DIR").ok(), Path::new("/data").is_dir())
    }

    /// Full path of the database file inside `data_dir`.
    pub fn database_path(data_dir: &Path) -> PathBuf {
        data_dir.join(DATABASE_FILE)
    }
}

fn resolve_data_dir(env: Option<String>, default_root_exists: bool) -> PathBuf {
    match env {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ if default_root_exists => PathBuf::from("/data"),
        _ => PathBuf::from("./data"),
    }
}

/// Create the data dir if needed and prove it is writable by creating and
/// deleting a tiny marker file.
pub fn check_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = dir.join(".write_check");
    std::fs::write(&marker, b"ok")
        .map_err(|e| DripError::Config(format!("{} is not writable: {e}", dir.display())))?;
    std::fs::remove_file(&marker)?;
    Ok(())
}

/// Connection pool and SQLite tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_mmap_size")]
    pub mmap_size: u64,
}

fn default_pool_size() -> u32 { 4 }
fn default_acquire_retries() -> u32 { 5 }
fn default_retry_base_ms() -> u64 { 100 }
fn default_busy_timeout_ms() -> u64 { 2000 }
fn default_mmap_size() -> u64 { 64 * 1024 * 1024 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            acquire_retries: default_acquire_retries(),
            retry_base_ms: default_retry_base_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            mmap_size: default_mmap_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_tick_secs() -> u64 { 30 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

/// Daily subscription-expiry sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    /// 5-field schedule expression, evaluated in local time.
    #[serde(default = "default_expiry_schedule")]
    pub schedule: String,
    /// Local time offset from UTC; defines "today" for `paid_through`.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Re-materialise the free track for demoted subscribers.
    #[serde(default)]
    pub replan_free_track: bool,
}

fn default_expiry_schedule() -> String { "5 0 * * *".into() }

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            schedule: default_expiry_schedule(),
            utc_offset_minutes: 0,
            replan_free_track: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn bool_true() -> bool { true }
fn default_poll_timeout() -> u64 { 30 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token: String::new(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

/// Admin API and payment webhook listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub admin_token: String,
    /// When set, the payment webhook requires a matching `X-Webhook-Secret` header.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8080 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: String::new(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WelcomeConfig {
    /// Pause between welcome-menu follow-ups (0 = back-to-back).
    #[serde(default)]
    pub followup_pause_ms: u64,
}
