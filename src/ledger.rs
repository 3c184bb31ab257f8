//! Completion ledger: which trackers were completed on which calendar days.

use crate::db::{day_key, parse_day, require_tracker, timestamp};
use crate::errors::{AppError, AppResult};
use crate::models::{CompletionRecord, CompletionStatistics};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{params, Connection};

/// Truncates a timestamp to its calendar day in a fixed UTC offset.
pub fn normalize_day(at: DateTime<Utc>, offset_minutes: i32) -> AppResult<NaiveDate> {
    let offset = FixedOffset::east_opt(offset_minutes.saturating_mul(60)).ok_or_else(|| {
        AppError::Validation(format!("day offset out of range: {} minutes", offset_minutes))
    })?;
    Ok(at.with_timezone(&offset).date_naive())
}

/// Inserts a record. Prefer [`toggle`], which supplies the existence check.
pub(crate) fn record_completion(conn: &Connection, tracker_id: &str, day: NaiveDate) -> AppResult<CompletionRecord> {
    require_tracker(conn, tracker_id)?;
    if is_completed(conn, tracker_id, day)? {
        return Err(AppError::Conflict(format!(
            "Tracker '{}' is already completed on {}",
            tracker_id, day
        )));
    }

    let now = Utc::now();
    conn.execute(
        "INSERT INTO completion_records (tracker_id, day, created_at) VALUES (?1, ?2, ?3)",
        params![tracker_id, day_key(day), timestamp(now)],
    )?;

    Ok(CompletionRecord {
        tracker_id: tracker_id.to_string(),
        day,
        created_at: now,
    })
}

pub(crate) fn remove_completion(conn: &Connection, tracker_id: &str, day: NaiveDate) -> AppResult<bool> {
    let removed = conn.execute(
        "DELETE FROM completion_records WHERE tracker_id = ?1 AND day = ?2",
        params![tracker_id, day_key(day)],
    )?;
    if removed == 0 {
        tracing::debug!(tracker_id = %tracker_id, day = %day, "no completion record to remove");
    }
    Ok(removed > 0)
}

/// Flips the completion state of `(tracker_id, day)` and returns the new state.
pub(crate) fn toggle(conn: &Connection, tracker_id: &str, day: NaiveDate) -> AppResult<bool> {
    require_tracker(conn, tracker_id)?;
    if is_completed(conn, tracker_id, day)? {
        remove_completion(conn, tracker_id, day)?;
        Ok(false)
    } else {
        record_completion(conn, tracker_id, day)?;
        Ok(true)
    }
}

pub(crate) fn is_completed(conn: &Connection, tracker_id: &str, day: NaiveDate) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM completion_records WHERE tracker_id = ?1 AND day = ?2",
        params![tracker_id, day_key(day)],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn count_for_tracker(conn: &Connection, tracker_id: &str) -> AppResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM completion_records WHERE tracker_id = ?1",
        [tracker_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

pub(crate) fn total_completed_count(conn: &Connection) -> AppResult<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM completion_records", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

pub(crate) fn delete_all_for_tracker(conn: &Connection, tracker_id: &str) -> AppResult<u64> {
    let removed = conn.execute("DELETE FROM completion_records WHERE tracker_id = ?1", [tracker_id])?;
    Ok(removed as u64)
}

pub(crate) fn completed_ids_for_day(conn: &Connection, day: NaiveDate) -> AppResult<Vec<String>> {
    let mut statement =
        conn.prepare("SELECT tracker_id FROM completion_records WHERE day = ?1 ORDER BY created_at ASC, rowid ASC")?;
    let ids = statement
        .query_map([day_key(day)], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub(crate) fn days_for_tracker(conn: &Connection, tracker_id: &str) -> AppResult<Vec<NaiveDate>> {
    let mut statement =
        conn.prepare("SELECT day FROM completion_records WHERE tracker_id = ?1 ORDER BY day ASC")?;
    let days = statement
        .query_map([tracker_id], |row| parse_day(&row.get::<_, String>(0)?))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(days)
}

pub(crate) fn clear_all(conn: &Connection) -> AppResult<u64> {
    let removed = conn.execute("DELETE FROM completion_records", [])?;
    Ok(removed as u64)
}

pub(crate) fn statistics(conn: &Connection) -> AppResult<CompletionStatistics> {
    let (total, active_days): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT day) FROM completion_records",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let best_day: i64 = conn.query_row(
        "SELECT COALESCE(MAX(per_day), 0) FROM (
           SELECT COUNT(*) AS per_day FROM completion_records GROUP BY day
         )",
        [],
        |row| row.get(0),
    )?;
    let trackers: i64 = conn.query_row("SELECT COUNT(*) FROM trackers", [], |row| row.get(0))?;

    Ok(CompletionStatistics {
        total_completions: total.max(0) as u64,
        tracker_count: trackers.max(0) as u64,
        active_days: active_days.max(0) as u64,
        best_day_count: best_day.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{NewTracker, Schedule};
    use chrono::TimeZone;

    fn day(year: i32, month: u32, date: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, date).expect("date")
    }

    fn setup(names: &[&str]) -> (tempfile::TempDir, Database, Vec<String>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("tracker.sqlite")).expect("db");
        db.create_category("Health").expect("category");
        let ids = names
            .iter()
            .map(|name| {
                db.insert_tracker(&NewTracker::new(*name, "#007BFA", "🥦", Schedule::EveryDay), "Health")
                    .expect("tracker")
                    .id
            })
            .collect();
        (dir, db, ids)
    }

    fn record_count(db: &Database, tracker_id: &str, on: NaiveDate) -> i64 {
        db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM completion_records WHERE tracker_id = ?1 AND day = ?2",
                params![tracker_id, day_key(on)],
                |row| row.get(0),
            )?)
        })
        .expect("count")
    }

    #[test]
    fn normalize_day_discards_time_of_day() {
        let morning = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).single().expect("time");
        let night = Utc.with_ymd_and_hms(2024, 1, 1, 23, 55, 0).single().expect("time");
        assert_eq!(normalize_day(morning, 0).expect("day"), day(2024, 1, 1));
        assert_eq!(normalize_day(night, 0).expect("day"), day(2024, 1, 1));

        assert_eq!(normalize_day(night, 180).expect("day"), day(2024, 1, 2));
        assert_eq!(normalize_day(morning, -60).expect("day"), day(2023, 12, 31));
        assert!(matches!(normalize_day(morning, 24 * 60), Err(AppError::Validation(_))));
    }

    #[test]
    fn toggle_twice_restores_the_original_state() {
        let (_dir, db, ids) = setup(&["Run"]);
        let id = &ids[0];
        let on = day(2024, 1, 1);

        assert!(db.with_transaction(|tx| toggle(tx, id, on)).expect("toggle"));
        assert!(db.with_conn(|conn| is_completed(conn, id, on)).expect("check"));
        assert!(!db.with_transaction(|tx| toggle(tx, id, on)).expect("toggle"));
        assert!(!db.with_conn(|conn| is_completed(conn, id, on)).expect("check"));
    }

    #[test]
    fn any_toggle_sequence_keeps_at_most_one_record_per_day() {
        let (_dir, db, ids) = setup(&["Run"]);
        let id = &ids[0];
        let days = [day(2024, 1, 1), day(2024, 1, 2), day(2024, 1, 1), day(2024, 1, 1), day(2024, 1, 2)];

        for on in days {
            db.with_transaction(|tx| toggle(tx, id, on)).expect("toggle");
            assert!(record_count(&db, id, on) <= 1);
        }
        assert_eq!(record_count(&db, id, day(2024, 1, 1)), 1);
        assert_eq!(record_count(&db, id, day(2024, 1, 2)), 0);
    }

    #[test]
    fn direct_record_rejects_duplicates_and_unknown_trackers() {
        let (_dir, db, ids) = setup(&["Run"]);
        let on = day(2024, 1, 1);
        db.with_transaction(|tx| record_completion(tx, &ids[0], on)).expect("record");

        let duplicate = db.with_transaction(|tx| record_completion(tx, &ids[0], on));
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));
        let unknown = db.with_transaction(|tx| record_completion(tx, "missing", on));
        assert!(matches!(unknown, Err(AppError::NotFound(_))));
        let unknown_toggle = db.with_transaction(|tx| toggle(tx, "missing", on));
        assert!(matches!(unknown_toggle, Err(AppError::NotFound(_))));
    }

    #[test]
    fn removing_an_absent_record_is_a_noop() {
        let (_dir, db, ids) = setup(&["Run"]);
        let removed = db
            .with_transaction(|tx| remove_completion(tx, &ids[0], day(2024, 1, 1)))
            .expect("remove");
        assert!(!removed);
    }

    #[test]
    fn counts_ids_and_statistics_aggregate_across_trackers() {
        let (_dir, db, ids) = setup(&["Run", "Swim"]);
        let first = day(2024, 1, 1);
        let second = day(2024, 1, 2);
        db.with_transaction(|tx| {
            toggle(tx, &ids[0], first)?;
            toggle(tx, &ids[0], second)?;
            toggle(tx, &ids[1], first)?;
            Ok(())
        })
        .expect("toggles");

        db.with_conn(|conn| {
            assert_eq!(count_for_tracker(conn, &ids[0])?, 2);
            assert_eq!(count_for_tracker(conn, &ids[1])?, 1);
            assert_eq!(total_completed_count(conn)?, 3);
            assert_eq!(completed_ids_for_day(conn, first)?, vec![ids[0].clone(), ids[1].clone()]);
            assert_eq!(days_for_tracker(conn, &ids[0])?, vec![first, second]);

            let stats = statistics(conn)?;
            assert_eq!(stats.total_completions, 3);
            assert_eq!(stats.tracker_count, 2);
            assert_eq!(stats.active_days, 2);
            assert_eq!(stats.best_day_count, 2);
            Ok(())
        })
        .expect("queries");

        let removed = db.with_transaction(|tx| delete_all_for_tracker(tx, &ids[0])).expect("delete");
        assert_eq!(removed, 2);
        let cleared = db.with_transaction(|tx| clear_all(tx)).expect("clear");
        assert_eq!(cleared, 1);
        assert_eq!(db.with_conn(|conn| statistics(conn)).expect("stats").total_completions, 0);
    }
}
