mod db;
mod errors;
mod ledger;
mod models;
mod observers;
mod pinning;
mod query;
mod service;

pub use crate::db::Database;
pub use crate::errors::{AppError, AppResult};
pub use crate::ledger::normalize_day;
pub use crate::models::{
    AppSettings, Category, CompletionRecord, CompletionStatistics, NameSearchMode, NewTracker, Schedule, StoreEvent,
    Tracker, TrackerFilter, TrackerSection, TrackerUpdate, Weekday, PINNED_CATEGORY_HEADER,
};
pub use crate::observers::{ObserverRegistry, SubscriptionId};
pub use crate::query::{QueryEngine, ResultSet, SectionOrder, TrackerQuery};
pub use crate::service::TrackerCore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Creates the app data directory, installs file logging and opens the tracker store.
pub fn bootstrap(app_data_dir: PathBuf) -> AppResult<Arc<TrackerCore>> {
    std::fs::create_dir_all(&app_data_dir)?;
    init_tracing(&app_data_dir.join("logs"))?;

    let core = TrackerCore::new(app_data_dir)?;
    tracing::info!(path = %core.db_path().display(), "tracker core ready");
    Ok(core)
}

pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "tracker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
