use crate::errors::{AppError, AppResult};
use crate::models::{
    require_header, AppSettings, Category, NewTracker, Tracker, TrackerUpdate, PINNED_CATEGORY_HEADER,
};
use crate::{ledger, pinning};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub(crate) const TRACKER_SELECT: &str =
    "SELECT t.id, t.name, t.color_token, t.emoji, t.schedule_json, t.is_pinned, t.category_id, c.header, t.original_category, t.created_at, t.updated_at
     FROM trackers t JOIN categories c ON c.id = t.category_id";

pub(crate) const TRACKER_ORDER: &str = " ORDER BY c.header ASC, t.created_at ASC, t.rowid ASC";

const CATEGORY_SELECT: &str = "SELECT id, header, is_pinned_category, created_at FROM categories";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    saved_changes: AtomicI64,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            saved_changes: AtomicI64::new(0),
        };

        db.ensure_default_settings()?;
        let baseline = db.total_changes()?;
        db.saved_changes.store(baseline, Ordering::SeqCst);

        tracing::info!(path = %path.display(), journal_mode = %journal_mode, "tracker database opened");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self.lock()?;
        op(&conn)
    }

    /// Runs `op` inside one transaction. Any error rolls every statement back.
    pub(crate) fn with_transaction<T>(&self, op: impl FnOnce(&Transaction<'_>) -> AppResult<T>) -> AppResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn create_category(&self, header: &str) -> AppResult<Category> {
        let header = require_header(header)?;
        if header == PINNED_CATEGORY_HEADER {
            return Err(AppError::Conflict(format!("Category header '{}' is reserved", header)));
        }

        self.with_transaction(|tx| {
            if find_category(tx, &header)?.is_some() {
                return Err(AppError::Conflict(format!("Category '{}' already exists", header)));
            }
            insert_category_row(tx, &header, false)
        })
    }

    pub fn list_categories(&self, include_pinned: bool) -> AppResult<Vec<Category>> {
        self.with_conn(|conn| {
            load_categories(
                conn,
                &format!("{} WHERE is_pinned_category = 0 OR ?1 = 1 ORDER BY header ASC", CATEGORY_SELECT),
                [include_pinned],
            )
        })
    }

    pub fn get_category_by_header(&self, header: &str) -> AppResult<Option<Category>> {
        let header = header.trim();
        let category = self.with_conn(|conn| find_category(conn, header))?;
        if category.is_none() {
            tracing::debug!(header = %header, "category lookup missed");
        }
        Ok(category)
    }

    pub fn insert_tracker(&self, new_tracker: &NewTracker, category_header: &str) -> AppResult<Tracker> {
        let new_tracker = new_tracker.validated()?;
        let header = require_header(category_header)?;

        self.with_transaction(|tx| {
            let category = require_category(tx, &header)?;
            if category.is_pinned_category {
                return Err(AppError::Conflict(
                    "Trackers enter the pinned category only by being pinned".to_string(),
                ));
            }

            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            tx.execute(
                "INSERT INTO trackers (
                   id, name, color_token, emoji, schedule_json, is_pinned, category_id,
                   original_category, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL, ?7, ?7)",
                params![
                    id,
                    new_tracker.name,
                    new_tracker.color_token,
                    new_tracker.emoji,
                    serde_json::to_string(&new_tracker.schedule)?,
                    category.id,
                    timestamp(now),
                ],
            )?;

            Ok(Tracker {
                id,
                name: new_tracker.name,
                color_token: new_tracker.color_token,
                emoji: new_tracker.emoji,
                schedule: new_tracker.schedule,
                is_pinned: false,
                category_id: category.id,
                category_header: category.header,
                original_category: None,
                created_at: now,
                updated_at: now,
            })
        })
    }

    pub fn get_tracker(&self, tracker_id: &str) -> AppResult<Option<Tracker>> {
        let tracker = self.with_conn(|conn| find_tracker(conn, tracker_id))?;
        if tracker.is_none() {
            tracing::debug!(tracker_id = %tracker_id, "tracker lookup missed");
        }
        Ok(tracker)
    }

    pub fn list_trackers(&self) -> AppResult<Vec<Tracker>> {
        self.with_conn(|conn| select_trackers(conn, "", &[]))
    }

    /// Overwrites the editable fields. A category change moves membership in the same
    /// transaction; for a pinned tracker it retargets the category an unpin returns to.
    pub fn update_tracker(&self, tracker_id: &str, update: &TrackerUpdate) -> AppResult<Tracker> {
        let update = update.validated()?;

        self.with_transaction(|tx| {
            let current = require_tracker(tx, tracker_id)?;
            let home = pinning::home_category(&current).to_string();

            tx.execute(
                "UPDATE trackers SET name = ?1, color_token = ?2, emoji = ?3, schedule_json = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    update.name,
                    update.color_token,
                    update.emoji,
                    serde_json::to_string(&update.schedule)?,
                    timestamp(Utc::now()),
                    tracker_id,
                ],
            )?;

            // A pinned tracker's edit form may echo back either its home or the pinned header.
            if update.category != home && update.category != current.category_header {
                pinning::change_category(tx, tracker_id, &update.category, &home)?;
            }

            require_tracker(tx, tracker_id)
        })
    }

    /// Deletes the tracker together with every completion record that references it.
    pub fn delete_tracker(&self, tracker_id: &str) -> AppResult<u64> {
        self.with_transaction(|tx| {
            require_tracker(tx, tracker_id)?;
            let removed = ledger::delete_all_for_tracker(tx, tracker_id)?;
            tx.execute("DELETE FROM trackers WHERE id = ?1", [tracker_id])?;
            Ok(removed)
        })
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        self.with_conn(read_settings)
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        self.with_transaction(|tx| {
            let current = read_settings(tx)?;
            let mut merged = serde_json::to_value(current)?;
            merge_json(&mut merged, update);
            let settings: AppSettings = serde_json::from_value(merged)
                .map_err(|error| AppError::Validation(error.to_string()))?;
            settings.validate()?;
            write_settings(tx, &settings)?;
            Ok(settings)
        })
    }

    /// Flushes committed work from the write-ahead log into the database file.
    /// Returns `false` without touching the file when nothing changed since the last save.
    pub fn save(&self) -> AppResult<bool> {
        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT total_changes()", [], |row| row.get(0))?;
        if total == self.saved_changes.load(Ordering::SeqCst) {
            return Ok(false);
        }

        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        self.saved_changes.store(total, Ordering::SeqCst);
        tracing::debug!(changes = total, "database checkpoint written");
        Ok(true)
    }

    fn total_changes(&self) -> AppResult<i64> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?))
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![serde_json::to_string(&AppSettings::default())?, timestamp(Utc::now())],
            )?;
            Ok(())
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

pub(crate) fn find_category(conn: &Connection, header: &str) -> AppResult<Option<Category>> {
    let category = conn
        .query_row(
            &format!("{} WHERE header = ?1", CATEGORY_SELECT),
            [header],
            parse_category_row,
        )
        .optional()?;
    match category {
        Some(mut category) => {
            category.tracker_ids = category_tracker_ids(conn, &category.id)?;
            Ok(Some(category))
        }
        None => Ok(None),
    }
}

pub(crate) fn require_category(conn: &Connection, header: &str) -> AppResult<Category> {
    find_category(conn, header)?.ok_or_else(|| AppError::NotFound(format!("Category '{}' not found", header)))
}

pub(crate) fn find_pinned_category(conn: &Connection) -> AppResult<Option<Category>> {
    let mut categories = load_categories(
        conn,
        &format!("{} WHERE is_pinned_category = 1 LIMIT 1", CATEGORY_SELECT),
        [],
    )?;
    Ok(categories.pop())
}

pub(crate) fn insert_category_row(conn: &Connection, header: &str, is_pinned_category: bool) -> AppResult<Category> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO categories (id, header, is_pinned_category, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, header, is_pinned_category, timestamp(now)],
    )?;

    Ok(Category {
        id,
        header: header.to_string(),
        is_pinned_category,
        tracker_ids: Vec::new(),
        created_at: now,
    })
}

pub(crate) fn find_tracker(conn: &Connection, tracker_id: &str) -> AppResult<Option<Tracker>> {
    conn.query_row(
        &format!("{} WHERE t.id = ?1", TRACKER_SELECT),
        [tracker_id],
        parse_tracker_row,
    )
    .optional()
    .map_err(AppError::from)
}

pub(crate) fn require_tracker(conn: &Connection, tracker_id: &str) -> AppResult<Tracker> {
    find_tracker(conn, tracker_id)?
        .ok_or_else(|| AppError::NotFound(format!("Tracker '{}' not found", tracker_id)))
}

/// Loads trackers matching `clause` (a `WHERE ...` fragment or empty), ordered by
/// category header, then creation order.
pub(crate) fn select_trackers(
    conn: &Connection,
    clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> AppResult<Vec<Tracker>> {
    let query = format!("{} {}{}", TRACKER_SELECT, clause, TRACKER_ORDER);
    let mut statement = conn.prepare(&query)?;
    let rows = statement.query_map(rusqlite::params_from_iter(params.iter()), parse_tracker_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub(crate) fn set_tracker_placement(
    conn: &Connection,
    tracker_id: &str,
    category_id: &str,
    is_pinned: bool,
    original_category: Option<&str>,
) -> AppResult<()> {
    let updated = conn.execute(
        "UPDATE trackers SET category_id = ?1, is_pinned = ?2, original_category = ?3, updated_at = ?4 WHERE id = ?5",
        params![category_id, is_pinned, original_category, timestamp(Utc::now()), tracker_id],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound(format!("Tracker '{}' not found", tracker_id)));
    }
    Ok(())
}

pub(crate) fn read_settings(conn: &Connection) -> AppResult<AppSettings> {
    let raw = conn
        .query_row("SELECT value_json FROM settings WHERE key = 'app'", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;

    match raw {
        Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw)?),
        None => Ok(AppSettings::default()),
    }
}

pub(crate) fn write_settings(conn: &Connection, settings: &AppSettings) -> AppResult<()> {
    conn.execute(
        "INSERT INTO settings (key, value_json, updated_at)
         VALUES ('app', ?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![serde_json::to_string(settings)?, timestamp(Utc::now())],
    )?;
    Ok(())
}

pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_day(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|error| conversion_error(error.to_string()))
}

fn load_categories(conn: &Connection, query: &str, params: impl rusqlite::Params) -> AppResult<Vec<Category>> {
    let mut statement = conn.prepare(query)?;
    let mut categories = statement
        .query_map(params, parse_category_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for category in &mut categories {
        category.tracker_ids = category_tracker_ids(conn, &category.id)?;
    }
    Ok(categories)
}

fn category_tracker_ids(conn: &Connection, category_id: &str) -> AppResult<Vec<String>> {
    let mut statement =
        conn.prepare("SELECT id FROM trackers WHERE category_id = ?1 ORDER BY created_at ASC, rowid ASC")?;
    let ids = statement
        .query_map([category_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn parse_category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        header: row.get(1)?,
        is_pinned_category: row.get::<_, i32>(2)? != 0,
        tracker_ids: Vec::new(),
        created_at: parse_time(&row.get::<_, String>(3)?)?,
    })
}

fn parse_tracker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tracker> {
    let schedule_raw: String = row.get(4)?;
    Ok(Tracker {
        id: row.get(0)?,
        name: row.get(1)?,
        color_token: row.get(2)?,
        emoji: row.get(3)?,
        schedule: serde_json::from_str(&schedule_raw).map_err(|error| conversion_error(error.to_string()))?,
        is_pinned: row.get::<_, i32>(5)? != 0,
        category_id: row.get(6)?,
        category_header: row.get(7)?,
        original_category: row.get(8)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
