//! Sectioned tracker views for the list screen.
//!
//! The engine owns exactly one current result set. Every fetch is stamped with a
//! generation and installed last-fetch-wins, so a slower, older fetch can never
//! overwrite the result of a newer one.

use crate::db::{select_trackers, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{NameSearchMode, Tracker, TrackerSection, Weekday};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const EVERY_DAY_JSON: &str = "\"every-day\"";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SectionOrder {
    /// Sections by category header, ascending.
    #[default]
    HeaderAscending,
    /// The pinned section first, the rest by header.
    PinnedFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerQuery {
    pub weekday: Option<Weekday>,
    pub include_ids: Option<Vec<String>>,
    pub exclude_ids: Option<Vec<String>>,
    pub name_contains: Option<String>,
    pub order: SectionOrder,
}

impl TrackerQuery {
    pub fn weekday(weekday: Weekday) -> Self {
        Self {
            weekday: Some(weekday),
            order: SectionOrder::PinnedFirst,
            ..Self::default()
        }
    }

    pub fn name_contains(text: impl Into<String>) -> Self {
        Self {
            name_contains: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn id_set(ids: Vec<String>, weekday: Weekday) -> Self {
        Self {
            weekday: Some(weekday),
            include_ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn excluding_id_set(ids: Vec<String>) -> Self {
        Self {
            exclude_ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, text: impl Into<String>) -> Self {
        self.name_contains = Some(text.into());
        self
    }

    fn where_clause(&self) -> (String, Vec<String>) {
        let mut clause = String::from("WHERE 1 = 1");
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(weekday) = self.weekday {
            clause.push_str(" AND (t.schedule_json = ? OR t.schedule_json LIKE ?)");
            params_vec.push(EVERY_DAY_JSON.to_string());
            params_vec.push(format!("%\"{}\"%", weekday.as_str()));
        }
        if let Some(ids) = &self.include_ids {
            clause.push_str(&format!(" AND t.id IN ({})", placeholders(ids.len())));
            params_vec.extend(ids.iter().cloned());
        }
        if let Some(ids) = self.exclude_ids.as_ref().filter(|ids| !ids.is_empty()) {
            clause.push_str(&format!(" AND t.id NOT IN ({})", placeholders(ids.len())));
            params_vec.extend(ids.iter().cloned());
        }

        (clause, params_vec)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub generation: u64,
    pub sections: Vec<TrackerSection>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn tracker_count(&self) -> usize {
        self.sections.iter().map(|section| section.trackers.len()).sum()
    }
}

pub struct QueryEngine {
    db: Arc<Database>,
    next_generation: AtomicU64,
    current: RwLock<Arc<ResultSet>>,
}

impl QueryEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            next_generation: AtomicU64::new(0),
            current: RwLock::new(Arc::new(ResultSet::default())),
        }
    }

    pub fn fetch_all(&self) -> AppResult<Arc<ResultSet>> {
        self.run(&TrackerQuery::default())
    }

    pub fn fetch_by_weekday(&self, weekday: Weekday) -> AppResult<Arc<ResultSet>> {
        self.run(&TrackerQuery::weekday(weekday))
    }

    pub fn fetch_by_name_contains(&self, text: &str) -> AppResult<Arc<ResultSet>> {
        self.run(&TrackerQuery::name_contains(text))
    }

    pub fn fetch_by_id_set(&self, ids: &[String], weekday: Weekday) -> AppResult<Arc<ResultSet>> {
        self.run(&TrackerQuery::id_set(ids.to_vec(), weekday))
    }

    pub fn fetch_excluding_id_set(&self, ids: &[String]) -> AppResult<Arc<ResultSet>> {
        self.run(&TrackerQuery::excluding_id_set(ids.to_vec()))
    }

    /// Executes `query`, installs the result as the current set and returns it.
    pub fn run(&self, query: &TrackerQuery) -> AppResult<Arc<ResultSet>> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let trackers = if query.include_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            Vec::new()
        } else {
            let (clause, params_vec) = query.where_clause();
            let name_search = self.db.get_settings()?.name_search;
            let trackers = self.db.with_conn(|conn| {
                let params: Vec<&dyn rusqlite::ToSql> =
                    params_vec.iter().map(|param| param as &dyn rusqlite::ToSql).collect();
                select_trackers(conn, &clause, &params)
            })?;
            filter_by_name(trackers, query.name_contains.as_deref(), name_search)
        };

        let result = Arc::new(ResultSet {
            generation,
            sections: group_sections(trackers, query.order),
        });

        if self.install(result.clone())? {
            tracing::debug!(
                generation,
                sections = result.sections.len(),
                trackers = result.tracker_count(),
                "tracker result set replaced"
            );
        } else {
            tracing::debug!(generation, "discarded result of a superseded fetch");
        }
        Ok(result)
    }

    pub fn current(&self) -> AppResult<Arc<ResultSet>> {
        let current = self
            .current
            .read()
            .map_err(|_| AppError::Internal("result set lock poisoned".to_string()))?;
        Ok(current.clone())
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.current()?.is_empty())
    }

    fn install(&self, result: Arc<ResultSet>) -> AppResult<bool> {
        let mut current = self
            .current
            .write()
            .map_err(|_| AppError::Internal("result set lock poisoned".to_string()))?;
        if result.generation <= current.generation {
            return Ok(false);
        }
        *current = result;
        Ok(true)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn filter_by_name(trackers: Vec<Tracker>, needle: Option<&str>, mode: NameSearchMode) -> Vec<Tracker> {
    match needle.map(str::trim).filter(|needle| !needle.is_empty()) {
        Some(needle) => trackers
            .into_iter()
            .filter(|tracker| mode.matches(&tracker.name, needle))
            .collect(),
        None => trackers,
    }
}

/// Groups trackers already sorted by header into sections. Sections are created only
/// when a tracker lands in them, so none is ever empty.
fn group_sections(trackers: Vec<Tracker>, order: SectionOrder) -> Vec<TrackerSection> {
    let mut sections: Vec<TrackerSection> = Vec::new();
    for tracker in trackers {
        match sections.last_mut() {
            Some(section) if section.header == tracker.category_header => section.trackers.push(tracker),
            _ => sections.push(TrackerSection {
                header: tracker.category_header.clone(),
                trackers: vec![tracker],
            }),
        }
    }

    if order == SectionOrder::PinnedFirst {
        // Stable: non-pinned sections keep their header order.
        sections.sort_by_key(|section| !section.trackers.iter().any(|tracker| tracker.is_pinned));
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTracker, Schedule, PINNED_CATEGORY_HEADER};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        engine: QueryEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("tracker.sqlite")).expect("db"));
        let engine = QueryEngine::new(db.clone());
        Fixture { _dir: dir, db, engine }
    }

    fn add(db: &Database, name: &str, schedule: Schedule, category: &str) -> Tracker {
        db.insert_tracker(&NewTracker::new(name, "#6E44FE", "🎸", schedule), category)
            .expect("tracker")
    }

    fn names(result: &ResultSet) -> Vec<(String, Vec<String>)> {
        result
            .sections
            .iter()
            .map(|section| {
                (
                    section.header.clone(),
                    section.trackers.iter().map(|tracker| tracker.name.clone()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn weekday_filter_matches_schedule_or_every_day() {
        let f = fixture();
        f.db.create_category("Health").expect("category");
        f.db.create_category("Chores").expect("category");
        add(&f.db, "Run", Schedule::weekdays([Weekday::Monday]), "Health");
        add(&f.db, "Swim", Schedule::weekdays([Weekday::Tuesday, Weekday::Thursday]), "Health");
        add(&f.db, "Dentist", Schedule::EveryDay, "Chores");

        for weekday in Weekday::ALL {
            let result = f.engine.fetch_by_weekday(weekday).expect("fetch");
            let all = f.db.list_trackers().expect("trackers");
            for tracker in all {
                let visible = result
                    .sections
                    .iter()
                    .any(|section| section.trackers.iter().any(|candidate| candidate.id == tracker.id));
                assert_eq!(visible, tracker.schedule.includes(weekday), "{} on {:?}", tracker.name, weekday);
            }
            assert!(result.sections.iter().all(|section| !section.trackers.is_empty()));
        }

        let monday = f.engine.fetch_by_weekday(Weekday::Monday).expect("fetch");
        assert_eq!(
            names(&monday),
            vec![
                ("Chores".to_string(), vec!["Dentist".to_string()]),
                ("Health".to_string(), vec!["Run".to_string()]),
            ]
        );
    }

    #[test]
    fn weekday_view_puts_the_pinned_section_first() {
        let f = fixture();
        f.db.create_category("Alpha").expect("category");
        f.db.create_category("Zulu").expect("category");
        add(&f.db, "Read", Schedule::EveryDay, "Alpha");
        let walk = add(&f.db, "Walk", Schedule::EveryDay, "Zulu");
        f.db.with_transaction(|tx| crate::pinning::pin_tracker(tx, &walk.id)).expect("pin");

        let weekday = f.engine.fetch_by_weekday(Weekday::Friday).expect("fetch");
        let headers: Vec<_> = weekday.sections.iter().map(|section| section.header.as_str()).collect();
        assert_eq!(headers, vec![PINNED_CATEGORY_HEADER, "Alpha"]);

        let by_name = f.engine.fetch_by_name_contains("").expect("fetch");
        let headers: Vec<_> = by_name.sections.iter().map(|section| section.header.as_str()).collect();
        assert_eq!(headers, vec!["Alpha", PINNED_CATEGORY_HEADER]);
    }

    #[test]
    fn name_search_honours_the_configured_case_mode() {
        let f = fixture();
        f.db.create_category("Health").expect("category");
        add(&f.db, "Run", Schedule::EveryDay, "Health");
        add(&f.db, "Swim", Schedule::EveryDay, "Health");

        let insensitive = f.engine.fetch_by_name_contains("ru").expect("fetch");
        assert_eq!(names(&insensitive), vec![("Health".to_string(), vec!["Run".to_string()])]);

        f.db.update_settings(serde_json::json!({ "nameSearch": "case-sensitive" }))
            .expect("settings");
        assert!(f.engine.fetch_by_name_contains("ru").expect("fetch").is_empty());
        assert_eq!(f.engine.fetch_by_name_contains("Ru").expect("fetch").tracker_count(), 1);
        assert!(f.engine.fetch_by_name_contains("Yoga").expect("fetch").sections.is_empty());
    }

    #[test]
    fn id_sets_select_and_exclude() {
        let f = fixture();
        f.db.create_category("Health").expect("category");
        let run = add(&f.db, "Run", Schedule::weekdays([Weekday::Monday]), "Health");
        let swim = add(&f.db, "Swim", Schedule::weekdays([Weekday::Tuesday]), "Health");
        let nap = add(&f.db, "Nap", Schedule::EveryDay, "Health");

        let completed = vec![run.id.clone(), swim.id.clone()];
        let monday = f.engine.fetch_by_id_set(&completed, Weekday::Monday).expect("fetch");
        assert_eq!(names(&monday), vec![("Health".to_string(), vec!["Run".to_string()])]);

        let none = f.engine.fetch_by_id_set(&[], Weekday::Monday).expect("fetch");
        assert!(none.is_empty());

        let rest = f.engine.fetch_excluding_id_set(&completed).expect("fetch");
        assert_eq!(rest.sections[0].trackers.len(), 1);
        assert_eq!(rest.sections[0].trackers[0].id, nap.id);

        let everything = f.engine.fetch_excluding_id_set(&[]).expect("fetch");
        assert_eq!(everything.tracker_count(), 3);
    }

    #[test]
    fn every_fetch_replaces_the_current_result_set() {
        let f = fixture();
        f.db.create_category("Health").expect("category");
        add(&f.db, "Run", Schedule::weekdays([Weekday::Monday]), "Health");

        assert!(f.engine.is_empty().expect("empty"));
        let monday = f.engine.fetch_by_weekday(Weekday::Monday).expect("fetch");
        assert!(!f.engine.is_empty().expect("empty"));
        assert_eq!(f.engine.current().expect("current").generation, monday.generation);

        let tuesday = f.engine.fetch_by_weekday(Weekday::Tuesday).expect("fetch");
        assert!(tuesday.generation > monday.generation);
        assert!(f.engine.is_empty().expect("empty"));
    }

    #[test]
    fn a_superseded_result_is_not_installed() {
        let f = fixture();
        let newer = Arc::new(ResultSet { generation: 5, sections: Vec::new() });
        let older = Arc::new(ResultSet { generation: 4, sections: Vec::new() });
        assert!(f.engine.install(newer).expect("install"));
        assert!(!f.engine.install(older).expect("install"));
        assert_eq!(f.engine.current().expect("current").generation, 5);
    }
}
