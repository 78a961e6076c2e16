//! "Recently changed" highlighting.
//!
//! Two policies coexist on purpose. The teacher's live timetable uses the
//! simple 24 hour window. Views that may show freshly seeded or bulk imported
//! data use the dual threshold, which hides anything touched within the last
//! five minutes.

use crate::models::ScheduleEntry;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const RECENT_WINDOW_HOURS: i64 = 24;
pub const SEED_SUPPRESSION_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecencyPolicy {
    Simple,
    DualThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewContext {
    TeacherTimetable,
    AdminOverview,
    AfterBulkLoad,
}

impl RecencyPolicy {
    pub fn for_view(context: ViewContext) -> Self {
        match context {
            ViewContext::TeacherTimetable => Self::Simple,
            ViewContext::AdminOverview | ViewContext::AfterBulkLoad => Self::DualThreshold,
        }
    }

    pub fn is_recent(self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now - updated_at;
        let within_window = age < Duration::hours(RECENT_WINDOW_HOURS);
        match self {
            Self::Simple => within_window,
            Self::DualThreshold => within_window && age > Duration::minutes(SEED_SUPPRESSION_MINUTES),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedEntry {
    #[serde(flatten)]
    pub entry: ScheduleEntry,
    pub recently_changed: bool,
}

pub fn classify(entries: Vec<ScheduleEntry>, policy: RecencyPolicy, now: DateTime<Utc>) -> Vec<ClassifiedEntry> {
    entries
        .into_iter()
        .map(|entry| {
            let recently_changed = policy.is_recent(entry.updated_at, now);
            ClassifiedEntry {
                entry,
                recently_changed,
            }
        })
        .collect()
}
