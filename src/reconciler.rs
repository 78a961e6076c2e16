//! Bulk import, export and clear-all.
//!
//! Imports run strictly row by row against a working set that starts as the
//! store contents at batch start and grows with every admitted row. Each
//! admitted row is committed on its own, so a bad row never rolls back the
//! rows before it.

use crate::conflict::{check_admissible, Admission, Candidate, Rejection};
use crate::db::{Database, NewEntry};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ClearReport, Day, ExportRow, ImportReport, Period, RawRow, RowError, RowErrorKind, ScheduleEntry, UserRecord,
};

pub fn import_rows(db: &Database, rows: &[RawRow]) -> AppResult<ImportReport> {
    let mut working_set = db.list_schedules(None)?;
    let mut report = ImportReport::default();

    for (row_index, row) in rows.iter().enumerate() {
        match admit_row(db, row, &working_set) {
            Ok(entry) => {
                working_set.push(entry);
                report.imported_count += 1;
            }
            Err((kind, reason)) => {
                tracing::debug!(row_index, kind = ?kind, reason = %reason, "import row rejected");
                report.errors.push(RowError {
                    row_index,
                    kind,
                    reason,
                });
            }
        }
    }

    tracing::info!(
        rows = rows.len(),
        imported = report.imported_count,
        rejected = report.errors.len(),
        "import finished"
    );
    Ok(report)
}

fn admit_row(
    db: &Database,
    row: &RawRow,
    working_set: &[ScheduleEntry],
) -> Result<ScheduleEntry, (RowErrorKind, String)> {
    let teacher = resolve_teacher(db, &row.teacher_name)?;

    let day = Day::parse(&row.day).ok_or_else(|| {
        (
            RowErrorKind::InvalidSlot,
            format!("Invalid day '{}'", row.day.trim()),
        )
    })?;
    let period = Period::parse(&row.period).ok_or_else(|| {
        (
            RowErrorKind::InvalidSlot,
            format!(
                "Invalid period '{}', expected {} to {}",
                row.period.trim(),
                Period::FIRST,
                Period::LAST
            ),
        )
    })?;

    let subject = row.subject.trim();
    let class_name = row.class_name.trim();
    let candidate = Candidate {
        id: None,
        teacher_id: &teacher.id,
        day,
        period,
        subject,
        class_name,
    };
    if let Admission::Reject(rejection) = check_admissible(&candidate, working_set) {
        return Err(rejection_to_row_error(rejection));
    }

    db.insert_schedule(&NewEntry {
        teacher_id: teacher.id.clone(),
        teacher_name: teacher.name.clone(),
        day,
        period,
        subject: subject.to_string(),
        class_name: class_name.to_string(),
        valid_until: None,
    })
    .map_err(store_error_to_row_error)
}

fn resolve_teacher(db: &Database, name: &str) -> Result<UserRecord, (RowErrorKind, String)> {
    let mut matches = db
        .find_teachers_by_name(name)
        .map_err(store_error_to_row_error)?;
    match matches.len() {
        0 => Err((
            RowErrorKind::UnknownTeacher,
            format!("Unknown teacher '{}'", name.trim()),
        )),
        1 => Ok(matches.remove(0)),
        count => Err((
            RowErrorKind::UnknownTeacher,
            format!("Ambiguous teacher '{}' matches {} users", name.trim(), count),
        )),
    }
}

fn rejection_to_row_error(rejection: Rejection) -> (RowErrorKind, String) {
    let kind = if rejection.is_conflict() {
        RowErrorKind::Conflict
    } else {
        RowErrorKind::Validation
    };
    (kind, rejection.to_string())
}

fn store_error_to_row_error(error: AppError) -> (RowErrorKind, String) {
    let kind = match &error {
        AppError::Conflict(_) | AppError::WriteConflict(_) => RowErrorKind::Conflict,
        _ => RowErrorKind::Validation,
    };
    (kind, error.to_string())
}

pub fn export_rows(db: &Database) -> AppResult<Vec<ExportRow>> {
    let rows = db
        .list_schedules(None)?
        .into_iter()
        .map(|entry| ExportRow {
            teacher_name: entry.teacher_name,
            day: entry.day,
            period: entry.period,
            subject: entry.subject,
            class_name: entry.class_name,
        })
        .collect();
    Ok(rows)
}

pub fn clear_all(db: &Database) -> AppResult<ClearReport> {
    let report = db.clear_schedules_and_change_logs()?;
    tracing::info!(
        schedules_deleted = report.schedules_deleted,
        change_logs_deleted = report.change_logs_deleted,
        "schedules cleared"
    );
    Ok(report)
}
