use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Header of the reserved category that holds pinned trackers.
pub const PINNED_CATEGORY_HEADER: &str = "Pinned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
        Self::Sunday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
            Self::Sunday => "sunday",
        }
    }

    pub fn of(day: NaiveDate) -> Self {
        day.weekday().into()
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(value: chrono::Weekday) -> Self {
        match value {
            chrono::Weekday::Mon => Self::Monday,
            chrono::Weekday::Tue => Self::Tuesday,
            chrono::Weekday::Wed => Self::Wednesday,
            chrono::Weekday::Thu => Self::Thursday,
            chrono::Weekday::Fri => Self::Friday,
            chrono::Weekday::Sat => Self::Saturday,
            chrono::Weekday::Sun => Self::Sunday,
        }
    }
}

/// When a tracker is actionable. Habits carry a weekday set, irregular
/// events use the `EveryDay` sentinel and match every weekday filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    EveryDay,
    Weekdays(BTreeSet<Weekday>),
}

impl Schedule {
    pub fn weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self::Weekdays(days.into_iter().collect())
    }

    pub fn includes(&self, day: Weekday) -> bool {
        match self {
            Self::EveryDay => true,
            Self::Weekdays(days) => days.contains(&day),
        }
    }

    pub fn is_every_day(&self) -> bool {
        matches!(self, Self::EveryDay)
    }

    fn validate(&self) -> AppResult<()> {
        match self {
            Self::Weekdays(days) if days.is_empty() => Err(AppError::Validation(
                "schedule must contain at least one weekday".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracker {
    pub id: String,
    pub name: String,
    pub color_token: String,
    pub emoji: String,
    pub schedule: Schedule,
    pub is_pinned: bool,
    pub category_id: String,
    pub category_header: String,
    /// Header of the category the tracker came from, set only while pinned.
    pub original_category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTracker {
    pub name: String,
    pub color_token: String,
    pub emoji: String,
    pub schedule: Schedule,
}

impl NewTracker {
    pub fn new(name: impl Into<String>, color_token: impl Into<String>, emoji: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            color_token: color_token.into(),
            emoji: emoji.into(),
            schedule,
        }
    }

    pub(crate) fn validated(&self) -> AppResult<Self> {
        self.schedule.validate()?;
        Ok(Self {
            name: require_text("name", &self.name)?,
            color_token: require_text("colorToken", &self.color_token)?,
            emoji: require_text("emoji", &self.emoji)?,
            schedule: self.schedule.clone(),
        })
    }
}

/// Full replacement of a tracker's editable fields, as submitted by the edit screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerUpdate {
    pub name: String,
    pub color_token: String,
    pub emoji: String,
    pub schedule: Schedule,
    pub category: String,
}

impl TrackerUpdate {
    pub(crate) fn validated(&self) -> AppResult<Self> {
        self.schedule.validate()?;
        Ok(Self {
            name: require_text("name", &self.name)?,
            color_token: require_text("colorToken", &self.color_token)?,
            emoji: require_text("emoji", &self.emoji)?,
            schedule: self.schedule.clone(),
            category: require_text("category", &self.category)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub header: String,
    pub is_pinned_category: bool,
    pub tracker_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub tracker_id: String,
    pub day: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSection {
    pub header: String,
    pub trackers: Vec<Tracker>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerFilter {
    #[default]
    AllTrackers,
    Today,
    Completed,
    Incomplete,
}

impl TrackerFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllTrackers => "all-trackers",
            Self::Today => "today",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "all-trackers" => Ok(Self::AllTrackers),
            "today" => Ok(Self::Today),
            "completed" => Ok(Self::Completed),
            "incomplete" => Ok(Self::Incomplete),
            other => Err(AppError::Validation(format!("Unknown filter '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NameSearchMode {
    #[default]
    CaseInsensitive,
    CaseSensitive,
}

impl NameSearchMode {
    pub fn matches(self, name: &str, needle: &str) -> bool {
        match self {
            Self::CaseSensitive => name.contains(needle),
            Self::CaseInsensitive => name.to_lowercase().contains(&needle.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub name_search: NameSearchMode,
    /// Fixed UTC offset used to truncate completion timestamps to a calendar day.
    pub day_offset_minutes: i32,
    pub allow_future_completion: bool,
    pub selected_filter: TrackerFilter,
    pub selected_category: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name_search: NameSearchMode::CaseInsensitive,
            day_offset_minutes: 0,
            allow_future_completion: false,
            selected_filter: TrackerFilter::AllTrackers,
            selected_category: None,
        }
    }
}

impl AppSettings {
    pub(crate) fn validate(&self) -> AppResult<()> {
        // chrono::FixedOffset accepts strictly less than one day either way.
        if self.day_offset_minutes.abs() >= 24 * 60 {
            return Err(AppError::Validation(format!(
                "dayOffsetMinutes out of range: {}",
                self.day_offset_minutes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStatistics {
    pub total_completions: u64,
    pub tracker_count: u64,
    pub active_days: u64,
    pub best_day_count: u64,
}

/// Published to observers after a command commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StoreEvent {
    CategoryCreated { header: String },
    CategoryDeleted { header: String },
    #[serde(rename_all = "camelCase")]
    TrackerCreated { tracker_id: String, category: String },
    #[serde(rename_all = "camelCase")]
    TrackerUpdated { tracker_id: String, category: String },
    #[serde(rename_all = "camelCase")]
    TrackerDeleted { tracker_id: String, removed_records: u64 },
    #[serde(rename_all = "camelCase")]
    TrackerPinned { tracker_id: String, original_category: String },
    #[serde(rename_all = "camelCase")]
    TrackerUnpinned { tracker_id: String, category: String },
    #[serde(rename_all = "camelCase")]
    CompletionChanged { tracker_id: String, day: NaiveDate, completed: bool },
    CompletionsCleared { removed: u64 },
    #[serde(rename_all = "camelCase")]
    SelectionChanged { filter: TrackerFilter, category: Option<String> },
    SettingsUpdated,
    ResultsReplaced { generation: u64, sections: usize },
}

fn require_text(field: &str, raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn require_header(raw: &str) -> AppResult<String> {
    require_text("header", raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_day_schedule_includes_all_weekdays() {
        assert!(Weekday::ALL.iter().all(|day| Schedule::EveryDay.includes(*day)));
        let habit = Schedule::weekdays([Weekday::Monday, Weekday::Friday]);
        assert!(habit.includes(Weekday::Friday));
        assert!(!habit.includes(Weekday::Sunday));
    }

    #[test]
    fn schedule_serializes_with_quoted_weekday_tokens() {
        let raw = serde_json::to_string(&Schedule::weekdays([Weekday::Tuesday, Weekday::Monday])).expect("json");
        assert_eq!(raw, r#"{"weekdays":["monday","tuesday"]}"#);
        assert_eq!(serde_json::to_string(&Schedule::EveryDay).expect("json"), r#""every-day""#);
    }

    #[test]
    fn weekday_of_known_date() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).expect("date");
        assert_eq!(Weekday::of(day), Weekday::Monday);
    }

    #[test]
    fn new_tracker_validation_trims_and_rejects_blank_fields() {
        let ok = NewTracker::new("  Run ", "#FD4C49", "🙂", Schedule::EveryDay)
            .validated()
            .expect("valid");
        assert_eq!(ok.name, "Run");

        let blank = NewTracker::new("   ", "#FD4C49", "🙂", Schedule::EveryDay).validated();
        assert!(matches!(blank, Err(AppError::Validation(_))));

        let no_days = NewTracker::new("Run", "#FD4C49", "🙂", Schedule::Weekdays(BTreeSet::new())).validated();
        assert!(matches!(no_days, Err(AppError::Validation(_))));
    }

    #[test]
    fn name_search_modes() {
        assert!(NameSearchMode::CaseInsensitive.matches("Run", "ru"));
        assert!(!NameSearchMode::CaseSensitive.matches("Run", "ru"));
        assert!(NameSearchMode::CaseSensitive.matches("Run", "Ru"));
        assert!(NameSearchMode::CaseInsensitive.matches("Бег", "бе"));
    }

    #[test]
    fn filter_round_trips_through_its_token() {
        for filter in [
            TrackerFilter::AllTrackers,
            TrackerFilter::Today,
            TrackerFilter::Completed,
            TrackerFilter::Incomplete,
        ] {
            assert_eq!(TrackerFilter::parse(filter.as_str()).expect("parse"), filter);
        }
        assert!(TrackerFilter::parse("weekly").is_err());
    }

    #[test]
    fn settings_fill_missing_fields_from_defaults() {
        let settings: AppSettings = serde_json::from_str(r#"{"allowFutureCompletion":true}"#).expect("json");
        assert!(settings.allow_future_completion);
        assert_eq!(settings.name_search, NameSearchMode::CaseInsensitive);
        assert_eq!(settings.selected_filter, TrackerFilter::AllTrackers);
    }
}
