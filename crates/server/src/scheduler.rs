//! Background task that materializes due recurring expenses and
//! installments, and takes a daily backup when the ledger is on disk.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use gastos_core::CoreError;
use gastos_engine::{generate_due, GenerationReport};
use gastos_storage::{create_backup, BackupInfo, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::main_lib::{now, AppState};

/// Runs the generator while holding the state's generator lock, so a manual
/// run from the API and a scheduled one never overlap.
pub async fn run_generator(
    state: &AppState,
    now: NaiveDateTime,
) -> Result<GenerationReport, CoreError> {
    let _guard = state.generator.lock().await;
    generate_due(&*state.store, now).await
}

/// `None` when the ledger is in memory and there is nothing to archive.
pub async fn backup_now(
    state: &AppState,
    kind: &str,
    now: NaiveDateTime,
) -> Result<Option<BackupInfo>, StoreError> {
    let Some(ledger) = &state.ledger else {
        return Ok(None);
    };
    create_backup(ledger, &state.backups.dir, kind, state.backups.keep, now)
        .await
        .map(Some)
}

/// Starts the periodic task. It exits once `shutdown` flips to `true`.
pub fn start_scheduler(
    state: Arc<AppState>,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.interval_minutes.max(1) * 60);
        info!(interval_minutes = config.interval_minutes, "Generator scheduler started");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.initial_delay_secs)) => {}
            _ = shutdown.changed() => {
                info!("Generator scheduler stopped before first run");
                return;
            }
        }

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_backup: Option<NaiveDate> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            run_scheduled(&state, &config, &mut last_backup, now()).await;
        }
        info!("Generator scheduler stopped");
    })
}

async fn run_scheduled(
    state: &AppState,
    config: &SchedulerConfig,
    last_backup: &mut Option<NaiveDate>,
    at: NaiveDateTime,
) {
    match run_generator(state, at).await {
        Ok(report) if report.created_count() > 0 => {
            info!(created = report.created_count(), "Scheduled generation completed")
        }
        Ok(_) => debug!("Scheduled generation: nothing due"),
        Err(e) => warn!("Scheduled generation failed: {e}"),
    }

    if !config.daily_backup || *last_backup == Some(at.date()) {
        return;
    }
    match backup_now(state, "auto", at).await {
        Ok(Some(_)) => *last_backup = Some(at.date()),
        Ok(None) => {
            debug!("Skipping backup: ledger is in memory");
            *last_backup = Some(at.date());
        }
        Err(e) => warn!("Scheduled backup failed: {e}"),
    }
}
