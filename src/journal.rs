//! Change journal for admitted schedule mutations.

use crate::errors::AppResult;
use crate::models::{ChangeLogRecord, Principal, ScheduleEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// Only edits of an existing entry are journaled. Creates, deletes and bulk
    /// loads are treated as seeding and leave no change record.
    pub fn journals(self) -> bool {
        matches!(self, Self::Update)
    }
}

pub trait ChangeLogSink {
    fn append_change(&self, record: &ChangeLogRecord) -> AppResult<()>;
}

/// Builds the record for an update, or `None` when the rendered value did not change.
pub fn build_change(
    actor: &Principal,
    before: &ScheduleEntry,
    after: &ScheduleEntry,
    timestamp: DateTime<Utc>,
) -> Option<ChangeLogRecord> {
    let old_value = before.rendered_value();
    let new_value = after.rendered_value();
    if old_value == new_value {
        return None;
    }

    Some(ChangeLogRecord {
        id: Uuid::new_v4().to_string(),
        schedule_id: before.id.clone(),
        teacher_id: before.teacher_id.clone(),
        teacher_name: before.teacher_name.clone(),
        day: before.day,
        period: before.period,
        old_value,
        new_value,
        changed_by: actor.name.clone(),
        timestamp,
    })
}

/// Journals an admitted mutation.
///
/// Best effort: the entity write has already happened and stays authoritative,
/// so a failed append is logged and `None` is returned.
pub fn record_change(
    sink: &dyn ChangeLogSink,
    kind: MutationKind,
    actor: &Principal,
    before: &ScheduleEntry,
    after: &ScheduleEntry,
) -> Option<ChangeLogRecord> {
    if !kind.journals() {
        return None;
    }

    let record = build_change(actor, before, after, after.updated_at)?;
    match sink.append_change(&record) {
        Ok(()) => {
            tracing::debug!(
                schedule_id = %record.schedule_id,
                changed_by = %record.changed_by,
                "change journaled"
            );
            Some(record)
        }
        Err(error) => {
            tracing::warn!(
                schedule_id = %record.schedule_id,
                error = %error,
                "failed to journal schedule change"
            );
            None
        }
    }
}
