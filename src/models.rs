use std::collections::BTreeMap;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

pub type Timestamp = i64;

/// Schema version written by this build. Older stores are migrated on load.
pub const STORE_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnoozedItem {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub favicon: Option<String>,
    pub creation_time: Timestamp,
    pub pop_time: Timestamp,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

impl SnoozedItem {
    /// Structural checks applied at every load boundary.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("empty id".to_string());
        }
        if self.url.trim().is_empty() {
            return Err(format!("item {} has an empty url", self.id));
        }
        if self.creation_time < 0 {
            return Err(format!("item {} has a negative creation_time", self.id));
        }
        if self.pop_time < 0 {
            return Err(format!("item {} has a negative pop_time", self.id));
        }
        if matches!(&self.group_id, Some(group) if group.trim().is_empty()) {
            return Err(format!("item {} has an empty group_id", self.id));
        }
        Ok(())
    }
}

/// What the host hands over when a tab is snoozed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TabRef {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub favicon: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SnoozeAction {
    LaterToday,
    ThisEvening,
    Tomorrow,
    ThisWeekend,
    NextMonday,
    InAWeek,
    InAMonth,
    PickDate { at: Timestamp },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum DeleteTarget {
    Item(String),
    Group(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionKind {
    Tab,
    Group,
}

impl DeleteTarget {
    pub fn kind(&self) -> DeletionKind {
        match self {
            DeleteTarget::Item(_) => DeletionKind::Tab,
            DeleteTarget::Group(_) => DeletionKind::Group,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            DeleteTarget::Item(id) | DeleteTarget::Group(id) => id,
        }
    }
}

/// Root durable object. `schedule` maps a wake bucket (the pop time in ms) to the
/// ids waking in it, kept in restore order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Store {
    pub version: u32,
    #[serde(default)]
    pub items: BTreeMap<String, SnoozedItem>,
    #[serde(default)]
    pub schedule: BTreeMap<Timestamp, Vec<String>>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            items: BTreeMap::new(),
            schedule: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Snapshot {
    pub taken_at: Timestamp,
    pub store: Store,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    /// Local clock time that counts as "morning", `HH:MM`.
    #[serde(default = "default_start_day")]
    pub start_day: String,
    /// Local clock time that counts as "evening", `HH:MM`.
    #[serde(default = "default_end_day")]
    pub end_day: String,
    /// 0 = Sunday .. 6 = Saturday.
    #[serde(default = "default_week_begin")]
    pub week_begin: u8,
    #[serde(default = "default_weekend_begin")]
    pub weekend_begin: u8,
    #[serde(default = "default_later_today_hours")]
    pub later_today_hours: u32,
    #[serde(default = "default_snapshot_interval_minutes")]
    pub snapshot_interval_minutes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            start_day: default_start_day(),
            end_day: default_end_day(),
            week_begin: default_week_begin(),
            weekend_begin: default_weekend_begin(),
            later_today_hours: default_later_today_hours(),
            snapshot_interval_minutes: default_snapshot_interval_minutes(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        let start = parse_clock(&self.start_day)
            .ok_or_else(|| format!("start_day '{}' is not a HH:MM time", self.start_day))?;
        let end = parse_clock(&self.end_day)
            .ok_or_else(|| format!("end_day '{}' is not a HH:MM time", self.end_day))?;
        if start >= end {
            return Err("start_day must be earlier than end_day".to_string());
        }
        if self.week_begin > 6 || self.weekend_begin > 6 {
            return Err("day-of-week settings must be between 0 and 6".to_string());
        }
        if self.later_today_hours == 0 {
            return Err("later_today_hours must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn start_time(&self) -> NaiveTime {
        parse_clock(&self.start_day).unwrap_or_else(|| {
            log::warn!("invalid start_day={} falling back to default", self.start_day);
            parse_clock(&default_start_day()).unwrap_or(NaiveTime::MIN)
        })
    }

    pub fn end_time(&self) -> NaiveTime {
        parse_clock(&self.end_day).unwrap_or_else(|| {
            log::warn!("invalid end_day={} falling back to default", self.end_day);
            parse_clock(&default_end_day()).unwrap_or(NaiveTime::MIN)
        })
    }
}

fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

fn default_start_day() -> String {
    "09:00".to_string()
}

fn default_end_day() -> String {
    "18:00".to_string()
}

fn default_week_begin() -> u8 {
    1
}

fn default_weekend_begin() -> u8 {
    6
}

fn default_later_today_hours() -> u32 {
    3
}

fn default_snapshot_interval_minutes() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettingsFile {
    pub schema_version: u32,
    pub settings: Settings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The primary store loaded as-is.
    Clean,
    /// The primary store's index had diverged and was rebuilt from its items.
    Repaired,
    /// The primary store was unusable and a snapshot replaced it.
    Snapshot,
    /// Nothing usable survived; an empty store was initialized.
    FullLoss,
    /// The store was replaced by user-supplied data.
    Imported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryResult {
    pub recovered: bool,
    pub tab_count: usize,
    pub sanitized: bool,
    pub outcome: RecoveryOutcome,
    #[serde(default)]
    pub dropped: usize,
}

impl RecoveryResult {
    pub fn clean(tab_count: usize) -> Self {
        Self {
            recovered: false,
            tab_count,
            sanitized: false,
            outcome: RecoveryOutcome::Clean,
            dropped: 0,
        }
    }

    /// Whether the user should see a recovery notification.
    pub fn should_notify(&self) -> bool {
        self.recovered || self.outcome == RecoveryOutcome::FullLoss
    }
}
