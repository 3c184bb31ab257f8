//! Category reassignment and the pin/unpin relocation protocol.
//!
//! A pinned tracker is physically moved into the reserved pinned category and
//! remembers the header it came from in `original_category`. Every function here
//! runs against the caller's transaction and performs all lookups before the
//! first write, so a miss leaves the placement untouched.

use crate::db::{find_pinned_category, insert_category_row, require_category, require_tracker, set_tracker_placement};
use crate::errors::{AppError, AppResult};
use crate::models::{Category, Tracker, PINNED_CATEGORY_HEADER};
use rusqlite::Connection;

/// The category a tracker lives in when it is not pinned.
pub(crate) fn home_category(tracker: &Tracker) -> &str {
    match (&tracker.original_category, tracker.is_pinned) {
        (Some(original), true) => original.as_str(),
        _ => tracker.category_header.as_str(),
    }
}

pub(crate) fn ensure_pinned_category(conn: &Connection) -> AppResult<Category> {
    if let Some(category) = find_pinned_category(conn)? {
        return Ok(category);
    }
    let category = insert_category_row(conn, PINNED_CATEGORY_HEADER, true)?;
    tracing::info!(category_id = %category.id, "pinned category created");
    Ok(category)
}

pub(crate) fn pin_tracker(conn: &Connection, tracker_id: &str) -> AppResult<Tracker> {
    let tracker = require_tracker(conn, tracker_id)?;
    if tracker.is_pinned {
        return Err(AppError::Conflict(format!("Tracker '{}' is already pinned", tracker_id)));
    }

    let pinned = ensure_pinned_category(conn)?;
    set_tracker_placement(conn, tracker_id, &pinned.id, true, Some(tracker.category_header.as_str()))?;
    require_tracker(conn, tracker_id)
}

pub(crate) fn unpin_tracker(conn: &Connection, tracker_id: &str) -> AppResult<Tracker> {
    let tracker = require_tracker(conn, tracker_id)?;
    let original = match (&tracker.original_category, tracker.is_pinned) {
        (Some(original), true) => original.clone(),
        _ => {
            return Err(AppError::Conflict(format!("Tracker '{}' is not pinned", tracker_id)));
        }
    };

    let home = require_category(conn, &original)?;
    set_tracker_placement(conn, tracker_id, &home.id, false, None)?;
    require_tracker(conn, tracker_id)
}

/// Moves a tracker from `old_header` to `new_header`. Equal headers move nothing.
/// For a pinned tracker the move retargets `original_category` and the tracker stays pinned.
pub(crate) fn change_category(
    conn: &Connection,
    tracker_id: &str,
    new_header: &str,
    old_header: &str,
) -> AppResult<Tracker> {
    let tracker = require_tracker(conn, tracker_id)?;
    if new_header == old_header {
        return Ok(tracker);
    }

    let old = require_category(conn, old_header)?;
    let new = require_category(conn, new_header)?;
    if new.is_pinned_category {
        return Err(AppError::Conflict(
            "Trackers enter the pinned category only by being pinned".to_string(),
        ));
    }
    if home_category(&tracker) != old.header {
        return Err(AppError::Conflict(format!(
            "Tracker '{}' is not in category '{}'",
            tracker_id, old.header
        )));
    }

    if tracker.is_pinned {
        set_tracker_placement(conn, tracker_id, &tracker.category_id, true, Some(new.header.as_str()))?;
    } else {
        set_tracker_placement(conn, tracker_id, &new.id, false, None)?;
    }

    tracing::debug!(tracker_id = %tracker_id, from = %old.header, to = %new.header, "tracker category changed");
    require_tracker(conn, tracker_id)
}

/// Deletes an empty user category. Categories still holding trackers, or remembered
/// by a pinned tracker as its way back, are kept.
pub(crate) fn delete_category(conn: &Connection, header: &str) -> AppResult<()> {
    let category = require_category(conn, header)?;
    if category.is_pinned_category {
        return Err(AppError::Conflict("The pinned category cannot be deleted".to_string()));
    }
    if !category.tracker_ids.is_empty() {
        return Err(AppError::Conflict(format!(
            "Category '{}' still holds {} tracker(s)",
            header,
            category.tracker_ids.len()
        )));
    }

    let remembered: i64 = conn.query_row(
        "SELECT COUNT(*) FROM trackers WHERE is_pinned = 1 AND original_category = ?1",
        [header],
        |row| row.get(0),
    )?;
    if remembered > 0 {
        return Err(AppError::Conflict(format!(
            "Category '{}' is the home of {} pinned tracker(s)",
            header, remembered
        )));
    }

    conn.execute("DELETE FROM categories WHERE id = ?1", [&category.id])?;
    Ok(())
}

pub(crate) fn is_pinned(conn: &Connection, tracker_id: &str) -> AppResult<bool> {
    Ok(require_tracker(conn, tracker_id)?.is_pinned)
}
