use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDateTime;
use gastos_core::{LedgerStore, DEFAULT_PAY_DAY};
use gastos_engine::{AutoMatcher, Categorizer};
use gastos_storage::{MemoryLedger, SqliteLedger};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{Config, LogFormat};
use crate::notifier::{LogNotifier, Notifier, TelegramNotifier};

pub struct BackupSettings {
    pub dir: PathBuf,
    pub keep: usize,
}

pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    /// Set when the ledger is on disk; backups need the database file.
    pub ledger: Option<SqliteLedger>,
    pub categorizer: Arc<Categorizer>,
    pub matcher: AutoMatcher,
    pub notifier: Arc<dyn Notifier>,
    /// Serializes generator runs between the scheduler and the API.
    pub generator: tokio::sync::Mutex<()>,
    pub backups: BackupSettings,
    pub pay_day: u32,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        categorizer: Arc<Categorizer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        AppState {
            store,
            ledger: None,
            categorizer,
            matcher: AutoMatcher::default(),
            notifier,
            generator: tokio::sync::Mutex::new(()),
            backups: BackupSettings {
                dir: PathBuf::from("backups"),
                keep: 7,
            },
            pay_day: DEFAULT_PAY_DAY,
            webhook_secret: None,
        }
    }
}

pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new(
                env!("CARGO_PKG_NAME").to_string(),
                std::io::stdout,
            ))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
    }
}

pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let (store, ledger): (Arc<dyn LedgerStore>, Option<SqliteLedger>) =
        match config.storage.database() {
            Some(path) => {
                let ledger = SqliteLedger::open(path)
                    .await
                    .with_context(|| format!("opening ledger at {}", path.display()))?;
                tracing::info!(path = %path.display(), "Ledger opened");
                (Arc::new(ledger.clone()) as Arc<dyn LedgerStore>, Some(ledger))
            }
            None => {
                tracing::warn!("No database configured, transactions are kept in memory only");
                (Arc::new(MemoryLedger::new()) as Arc<dyn LedgerStore>, None)
            }
        };

    let categorizer = Arc::new(Categorizer::from_config(&config.categorizer));

    let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_config(&config.telegram)? {
        Some(bot) => {
            tracing::info!("Telegram notifications enabled");
            Arc::new(bot)
        }
        None => {
            tracing::info!("Telegram not configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    let mut state = AppState::new(store, categorizer, notifier);
    state.ledger = ledger;
    state.matcher = config.reconcile;
    state.backups = BackupSettings {
        dir: config.storage.backup_dir.clone(),
        keep: config.storage.backups_keep,
    };
    state.pay_day = config.period.pay_day;
    state.webhook_secret = config
        .telegram
        .webhook_secret
        .clone()
        .filter(|s| !s.is_empty());
    Ok(Arc::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_config_builds_without_disk() {
        let mut config = Config::default();
        config.storage.db_path = PathBuf::from(crate::config::IN_MEMORY);
        let state = build_state(&config).await.unwrap();
        assert!(state.ledger.is_none());
        assert_eq!(state.pay_day, DEFAULT_PAY_DAY);
        assert!(state.webhook_secret.is_none());
    }

    #[tokio::test]
    async fn sqlite_config_opens_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.db_path = dir.path().join("gastos.db");
        config.telegram.webhook_secret = Some("s3cret".into());
        let state = build_state(&config).await.unwrap();
        assert!(state.ledger.is_some());
        assert_eq!(state.webhook_secret.as_deref(), Some("s3cret"));
    }
}
