use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use gastos_core::DEFAULT_PAY_DAY;
use gastos_engine::{AutoMatcher, CategorizerConfig};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "gastos.toml";
/// `db_path` value that selects the in-memory ledger.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub categorizer: CategorizerConfig,
    pub reconcile: AutoMatcher,
    pub scheduler: SchedulerConfig,
    pub telegram: TelegramConfig,
    pub period: PeriodConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub cors_allow: Vec<String>,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cors_allow: vec!["*".to_string()],
            body_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backups_keep: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/gastos.db"),
            backup_dir: PathBuf::from("backups"),
            backups_keep: 7,
        }
    }
}

impl StorageConfig {
    /// `None` when the ledger lives in memory only.
    pub fn database(&self) -> Option<&Path> {
        if self.db_path.as_os_str().is_empty() || self.db_path == Path::new(IN_MEMORY) {
            None
        } else {
            Some(&self.db_path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub initial_delay_secs: u64,
    /// Take an automatic backup at most once per calendar day.
    pub daily_backup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
            initial_delay_secs: 5,
            daily_backup: true,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub webhook_secret: Option<String>,
    pub api_base: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            webhook_secret: None,
            api_base: "https://api.telegram.org".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

// Keeps the bot token and webhook secret out of logs.
impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        matches!((&self.bot_token, &self.chat_id), (Some(t), Some(c)) if !t.is_empty() && !c.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeriodConfig {
    pub pay_day: u32,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            pay_day: DEFAULT_PAY_DAY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

impl Config {
    /// Reads `GASTOS_CONFIG` (default `./gastos.toml`) when present, then
    /// applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("GASTOS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let path = Path::new(&path);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(addr) = var("GASTOS_LISTEN_ADDR") {
            self.server.listen_addr = addr
                .parse()
                .with_context(|| format!("invalid GASTOS_LISTEN_ADDR: {addr}"))?;
        }
        if let Some(path) = var("GASTOS_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(token) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(chat) = var("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(chat);
        }
        if let Some(secret) = var("TELEGRAM_WEBHOOK_SECRET") {
            self.telegram.webhook_secret = Some(secret);
        }
        if let Some(format) = var("GASTOS_LOG_FORMAT") {
            self.log.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            };
        }
        Ok(())
    }
}
