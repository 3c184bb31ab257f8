use crate::db::{read_settings, write_settings, Database};
use crate::errors::{AppError, AppResult};
use crate::ledger::{self, normalize_day};
use crate::models::{
    require_header, AppSettings, Category, CompletionStatistics, NewTracker, StoreEvent, Tracker, TrackerFilter, TrackerSection,
    TrackerUpdate, Weekday,
};
use crate::observers::{ObserverRegistry, SubscriptionId};
use crate::pinning;
use crate::query::{QueryEngine, ResultSet, TrackerQuery};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

const DATABASE_FILE: &str = "tracker.sqlite";

/// Entry point used by the UI layer. Every command commits before its event is published.
pub struct TrackerCore {
    db: Arc<Database>,
    queries: QueryEngine,
    observers: ObserverRegistry,
    app_data_dir: PathBuf,
}

impl TrackerCore {
    pub fn new(app_data_dir: PathBuf) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&app_data_dir.join(DATABASE_FILE))?);
        Ok(Arc::new(Self {
            queries: QueryEngine::new(db.clone()),
            db,
            observers: ObserverRegistry::new(),
            app_data_dir,
        }))
    }

    /// Opens a database file directly, outside of an app data directory.
    pub fn open(db_path: &Path) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(db_path)?);
        let app_data_dir = db_path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Arc::new(Self {
            queries: QueryEngine::new(db.clone()),
            db,
            observers: ObserverRegistry::new(),
            app_data_dir,
        }))
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    pub fn db_path(&self) -> &Path {
        self.db.path()
    }

    pub fn subscribe(&self, observer: impl Fn(&StoreEvent) + Send + Sync + 'static) -> AppResult<SubscriptionId> {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> AppResult<bool> {
        self.observers.unsubscribe(id)
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<StoreEvent> {
        self.observers.subscribe_channel()
    }

    pub fn create_category(&self, header: &str) -> AppResult<Category> {
        let category = logged("create_category", self.db.create_category(header))?;
        tracing::info!(category_id = %category.id, header = %category.header, "category created");
        self.observers.publish(StoreEvent::CategoryCreated {
            header: category.header.clone(),
        });
        Ok(category)
    }

    /// Deletes an empty category. A deleted selected category is deselected in the same transaction.
    pub fn delete_category(&self, header: &str) -> AppResult<()> {
        let header = logged("delete_category", require_header(header))?;
        let header = header.as_str();
        let deselected = logged(
            "delete_category",
            self.db.with_transaction(|tx| {
                pinning::delete_category(tx, header)?;
                let mut settings = read_settings(tx)?;
                if settings.selected_category.as_deref() != Some(header) {
                    return Ok(None);
                }
                settings.selected_category = None;
                write_settings(tx, &settings)?;
                Ok(Some(settings.selected_filter))
            }),
        )?;

        tracing::info!(header = %header, "category deleted");
        self.observers.publish(StoreEvent::CategoryDeleted {
            header: header.to_string(),
        });
        if let Some(filter) = deselected {
            self.observers.publish(StoreEvent::SelectionChanged { filter, category: None });
        }
        Ok(())
    }

    pub fn create_tracker(&self, new_tracker: &NewTracker, category_header: &str) -> AppResult<Tracker> {
        let tracker = logged("create_tracker", self.db.insert_tracker(new_tracker, category_header))?;
        tracing::info!(tracker_id = %tracker.id, category = %tracker.category_header, "tracker created");
        self.observers.publish(StoreEvent::TrackerCreated {
            tracker_id: tracker.id.clone(),
            category: tracker.category_header.clone(),
        });
        Ok(tracker)
    }

    pub fn create_tracker_in_selected_category(&self, new_tracker: &NewTracker) -> AppResult<Tracker> {
        let selected = self.selected_category()?.ok_or_else(|| {
            AppError::Validation("Select a category before creating a tracker".to_string())
        });
        let selected = logged("create_tracker_in_selected_category", selected)?;
        self.create_tracker(new_tracker, &selected)
    }

    pub fn update_tracker(&self, tracker_id: &str, update: &TrackerUpdate) -> AppResult<Tracker> {
        let tracker = logged("update_tracker", self.db.update_tracker(tracker_id, update))?;
        self.observers.publish(StoreEvent::TrackerUpdated {
            tracker_id: tracker.id.clone(),
            category: pinning::home_category(&tracker).to_string(),
        });
        Ok(tracker)
    }

    /// Returns the number of completion records removed with the tracker.
    pub fn delete_tracker(&self, tracker_id: &str) -> AppResult<u64> {
        let removed = logged("delete_tracker", self.db.delete_tracker(tracker_id))?;
        tracing::info!(tracker_id = %tracker_id, removed_records = removed, "tracker deleted");
        self.observers.publish(StoreEvent::TrackerDeleted {
            tracker_id: tracker_id.to_string(),
            removed_records: removed,
        });
        Ok(removed)
    }

    pub fn pin(&self, tracker_id: &str) -> AppResult<Tracker> {
        let tracker = logged("pin", self.db.with_transaction(|tx| pinning::pin_tracker(tx, tracker_id)))?;
        self.observers.publish(StoreEvent::TrackerPinned {
            tracker_id: tracker.id.clone(),
            original_category: pinning::home_category(&tracker).to_string(),
        });
        Ok(tracker)
    }

    pub fn unpin(&self, tracker_id: &str) -> AppResult<Tracker> {
        let tracker = logged("unpin", self.db.with_transaction(|tx| pinning::unpin_tracker(tx, tracker_id)))?;
        self.observers.publish(StoreEvent::TrackerUnpinned {
            tracker_id: tracker.id.clone(),
            category: tracker.category_header.clone(),
        });
        Ok(tracker)
    }

    /// Flips completion of `tracker_id` on `day` and returns the new state.
    pub fn toggle_completion(&self, tracker_id: &str, day: NaiveDate) -> AppResult<bool> {
        let settings = self.db.get_settings()?;
        let latest_day = if settings.allow_future_completion {
            None
        } else {
            Some(normalize_day(Utc::now(), settings.day_offset_minutes)?)
        };

        let completed = logged(
            "toggle_completion",
            self.db.with_transaction(|tx| {
                // Only recording is date-limited; an existing future record can always be removed.
                if let Some(today) = latest_day {
                    if day > today && !ledger::is_completed(tx, tracker_id, day)? {
                        return Err(AppError::Validation(format!(
                            "Cannot complete a tracker on {}, after today ({})",
                            day, today
                        )));
                    }
                }
                ledger::toggle(tx, tracker_id, day)
            }),
        )?;
        tracing::debug!(tracker_id = %tracker_id, day = %day, completed, "completion toggled");
        self.observers.publish(StoreEvent::CompletionChanged {
            tracker_id: tracker_id.to_string(),
            day,
            completed,
        });
        Ok(completed)
    }

    /// Like [`toggle_completion`](Self::toggle_completion), normalising `at` with the configured day offset.
    pub fn toggle_completion_at(&self, tracker_id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let day = normalize_day(at, self.db.get_settings()?.day_offset_minutes)?;
        self.toggle_completion(tracker_id, day)
    }

    pub fn clear_all_completions(&self) -> AppResult<u64> {
        let removed = logged("clear_all_completions", self.db.with_transaction(|tx| ledger::clear_all(tx)))?;
        tracing::info!(removed, "completion records cleared");
        self.observers.publish(StoreEvent::CompletionsCleared { removed });
        Ok(removed)
    }

    /// Selects the category new trackers are created in; `None` clears the selection.
    pub fn set_selected_category(&self, header: Option<&str>) -> AppResult<()> {
        let header = logged("set_selected_category", header.map(require_header).transpose())?;
        let settings = logged(
            "set_selected_category",
            self.db.with_transaction(|tx| {
                if let Some(header) = header.as_deref() {
                    match crate::db::find_category(tx, header)? {
                        Some(category) if !category.is_pinned_category => {}
                        Some(_) => {
                            return Err(AppError::Validation(
                                "The pinned category cannot be selected".to_string(),
                            ));
                        }
                        None => {
                            return Err(AppError::Validation(format!("Unknown category '{}'", header)));
                        }
                    }
                }
                let mut settings = read_settings(tx)?;
                settings.selected_category = header.clone();
                write_settings(tx, &settings)?;
                Ok(settings)
            }),
        )?;

        self.observers.publish(StoreEvent::SelectionChanged {
            filter: settings.selected_filter,
            category: settings.selected_category,
        });
        Ok(())
    }

    pub fn selected_category(&self) -> AppResult<Option<String>> {
        Ok(self.db.get_settings()?.selected_category)
    }

    pub fn set_selected_filter(&self, filter: TrackerFilter) -> AppResult<()> {
        let settings = logged(
            "set_selected_filter",
            self.db.with_transaction(|tx| {
                let mut settings = read_settings(tx)?;
                settings.selected_filter = filter;
                write_settings(tx, &settings)?;
                Ok(settings)
            }),
        )?;

        self.observers.publish(StoreEvent::SelectionChanged {
            filter: settings.selected_filter,
            category: settings.selected_category,
        });
        Ok(())
    }

    pub fn selected_filter(&self) -> AppResult<TrackerFilter> {
        Ok(self.db.get_settings()?.selected_filter)
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let settings = logged("update_settings", self.db.update_settings(update))?;
        self.observers.publish(StoreEvent::SettingsUpdated);
        Ok(settings)
    }

    pub fn settings(&self) -> AppResult<AppSettings> {
        self.db.get_settings()
    }

    pub fn save(&self) -> AppResult<bool> {
        logged("save", self.db.save())
    }

    pub fn fetch_all(&self) -> AppResult<Arc<ResultSet>> {
        self.replaced(self.queries.fetch_all())
    }

    pub fn fetch_by_weekday(&self, weekday: Weekday) -> AppResult<Arc<ResultSet>> {
        self.replaced(self.queries.fetch_by_weekday(weekday))
    }

    pub fn fetch_by_name_contains(&self, text: &str) -> AppResult<Arc<ResultSet>> {
        self.replaced(self.queries.fetch_by_name_contains(text))
    }

    pub fn fetch_by_id_set(&self, ids: &[String], weekday: Weekday) -> AppResult<Arc<ResultSet>> {
        self.replaced(self.queries.fetch_by_id_set(ids, weekday))
    }

    pub fn fetch_excluding_id_set(&self, ids: &[String]) -> AppResult<Arc<ResultSet>> {
        self.replaced(self.queries.fetch_excluding_id_set(ids))
    }

    /// Fetches what the list screen shows for `date` under the selected filter,
    /// narrowed by `search_text` when it is not blank.
    pub fn fetch_visible(&self, date: NaiveDate, search_text: &str) -> AppResult<Arc<ResultSet>> {
        let filter = self.selected_filter()?;
        let mut query = match filter {
            TrackerFilter::AllTrackers => TrackerQuery::weekday(Weekday::of(date)),
            TrackerFilter::Today => TrackerQuery::weekday(Weekday::of(self.today()?)),
            TrackerFilter::Completed => {
                TrackerQuery::id_set(self.completed_ids_for_day(date)?, Weekday::of(date))
            }
            TrackerFilter::Incomplete => TrackerQuery::excluding_id_set(self.completed_ids_for_day(date)?),
        };
        if !search_text.trim().is_empty() {
            query = query.with_name(search_text);
        }

        tracing::debug!(filter = filter.as_str(), date = %date, "fetching visible trackers");
        self.replaced(self.queries.run(&query))
    }

    pub fn current_sections(&self) -> AppResult<Vec<TrackerSection>> {
        Ok(self.queries.current()?.sections.clone())
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        self.queries.is_empty()
    }

    pub fn list_categories(&self, include_pinned: bool) -> AppResult<Vec<Category>> {
        self.db.list_categories(include_pinned)
    }

    pub fn get_category(&self, header: &str) -> AppResult<Option<Category>> {
        self.db.get_category_by_header(header)
    }

    pub fn get_tracker(&self, tracker_id: &str) -> AppResult<Option<Tracker>> {
        self.db.get_tracker(tracker_id)
    }

    pub fn list_trackers(&self) -> AppResult<Vec<Tracker>> {
        self.db.list_trackers()
    }

    pub fn is_pinned(&self, tracker_id: &str) -> AppResult<bool> {
        self.db.with_conn(|conn| pinning::is_pinned(conn, tracker_id))
    }

    pub fn is_completed(&self, tracker_id: &str, day: NaiveDate) -> AppResult<bool> {
        self.db.with_conn(|conn| ledger::is_completed(conn, tracker_id, day))
    }

    pub fn count_for_tracker(&self, tracker_id: &str) -> AppResult<u64> {
        self.db.with_conn(|conn| ledger::count_for_tracker(conn, tracker_id))
    }

    pub fn total_completed_count(&self) -> AppResult<u64> {
        self.db.with_conn(ledger::total_completed_count)
    }

    pub fn completed_ids_for_day(&self, day: NaiveDate) -> AppResult<Vec<String>> {
        self.db.with_conn(|conn| ledger::completed_ids_for_day(conn, day))
    }

    /// Days on which the tracker was completed, oldest first.
    pub fn completion_days(&self, tracker_id: &str) -> AppResult<Vec<NaiveDate>> {
        self.db.with_conn(|conn| ledger::days_for_tracker(conn, tracker_id))
    }

    pub fn statistics(&self) -> AppResult<CompletionStatistics> {
        self.db.with_conn(ledger::statistics)
    }

    /// Today's calendar day under the configured offset.
    pub fn today(&self) -> AppResult<NaiveDate> {
        normalize_day(Utc::now(), self.db.get_settings()?.day_offset_minutes)
    }

    fn replaced(&self, result: AppResult<Arc<ResultSet>>) -> AppResult<Arc<ResultSet>> {
        let result = logged("fetch", result)?;
        if self.queries.current()?.generation == result.generation {
            self.observers.publish(StoreEvent::ResultsReplaced {
                generation: result.generation,
                sections: result.sections.len(),
            });
        }
        Ok(result)
    }
}

fn logged<T>(operation: &'static str, result: AppResult<T>) -> AppResult<T> {
    if let Err(error) = &result {
        tracing::warn!(operation, code = error.code(), error = %error, "tracker command failed");
    }
    result
}
