use crate::conflict::{check_admissible, Candidate};
use crate::errors::{AppError, AppResult};
use crate::journal::ChangeLogSink;
use crate::models::{
    BreakSetting, ChangeLogRecord, ChangeRequest, ChangeRequestStatus, ClearReport, CreateUserPayload, Day,
    NotificationCategory, NotificationRecord, Period, Principal, Recipient, Role, ScheduleEntry, UserRecord,
};
use crate::notify::Mailbox;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BREAK_SETTINGS_ID: &str = "break_settings";
const SCHEDULE_COLUMNS: &str =
    "id, teacher_id, teacher_name, day, period, subject, class_name, updated_at, valid_until, version";
const USER_COLUMNS: &str = "id, username, name, role, designation, created_at";
const NOTIFICATION_COLUMNS: &str = "id, category, title, message, from_user_id, from_user_name, recipient_kind, recipient_id, timestamp, read, metadata_json";
const NOTIFICATION_LIST_LIMIT: u32 = 200;

/// A schedule entry that has not been admitted yet.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub teacher_id: String,
    pub teacher_name: String,
    pub day: Day,
    pub period: Period,
    pub subject: String,
    pub class_name: String,
    pub valid_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    default_break_after_period: u8,
}

impl Database {
    pub fn new(path: &Path, default_break_after_period: u8) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            default_break_after_period,
        };

        db.ensure_schema_extensions()?;
        db.ensure_default_break_setting()?;

        Ok(db)
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Users ────────────────────────────────────────────────────────────────

    pub fn insert_user(&self, payload: &CreateUserPayload) -> AppResult<UserRecord> {
        let username = payload.username.trim();
        let name = payload.name.trim();
        if username.is_empty() {
            return Err(AppError::validation("username", "must not be empty"));
        }
        if name.is_empty() {
            return Err(AppError::validation("name", "must not be empty"));
        }

        let conn = self.connection()?;
        let taken: i64 = conn.query_row(
            "SELECT COUNT(1) FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(AppError::validation("username", "username already exists"));
        }

        let user = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            name: name.to_string(),
            role: payload.role,
            designation: payload
                .designation
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            created_at: now(),
        };
        conn.execute(
            "INSERT INTO users (id, username, name, role, designation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.username,
                user.name,
                user.role.as_str(),
                user.designation,
                format_time(user.created_at),
            ],
        )?;
        Ok(user)
    }

    pub fn list_users(&self) -> AppResult<Vec<UserRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY created_at ASC", USER_COLUMNS))?;
        let rows = stmt.query_map([], parse_user_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_user(&self, user_id: &str) -> AppResult<Option<UserRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            [user_id],
            parse_user_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn find_user_by_username(&self, username: &str) -> AppResult<Option<UserRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
            [username.trim()],
            parse_user_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn find_teachers_by_name(&self, name: &str) -> AppResult<Vec<UserRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users WHERE role = 'teacher' AND name = ?1",
            USER_COLUMNS
        ))?;
        let rows = stmt
            .query_map([name.trim()], parse_user_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes the user and every schedule entry assigned to them.
    pub fn delete_user(&self, user_id: &str) -> AppResult<bool> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
        if deleted == 0 {
            return Ok(false);
        }
        let schedules = tx.execute("DELETE FROM schedules WHERE teacher_id = ?1", [user_id])?;
        tx.commit()?;
        tracing::info!(user_id, schedules_deleted = schedules, "user deleted");
        Ok(true)
    }

    pub fn count_users(&self) -> AppResult<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ─── Schedule entries ─────────────────────────────────────────────────────

    pub fn list_schedules(&self, teacher_id: Option<&str>) -> AppResult<Vec<ScheduleEntry>> {
        let conn = self.connection()?;
        let mut query = format!("SELECT {} FROM schedules", SCHEDULE_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();
        if let Some(teacher_id) = teacher_id {
            query.push_str(" WHERE teacher_id = ?");
            params_vec.push(teacher_id.to_string());
        }

        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), parse_schedule_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        result.sort_by(|a, b| (a.day, a.period, &a.teacher_name).cmp(&(b.day, b.period, &b.teacher_name)));
        Ok(result)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> AppResult<Option<ScheduleEntry>> {
        let conn = self.connection()?;
        select_schedule(&conn, schedule_id)
    }

    pub fn count_schedules(&self) -> AppResult<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM schedules", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Admits a new entry. The slot is read, checked and written inside one
    /// immediate transaction, so two writers cannot both pass the check.
    pub fn insert_schedule(&self, new_entry: &NewEntry) -> AppResult<ScheduleEntry> {
        let entry = ScheduleEntry {
            id: Uuid::new_v4().to_string(),
            teacher_id: new_entry.teacher_id.clone(),
            teacher_name: new_entry.teacher_name.clone(),
            day: new_entry.day,
            period: new_entry.period,
            subject: new_entry.subject.trim().to_string(),
            class_name: new_entry.class_name.trim().to_string(),
            updated_at: now(),
            valid_until: new_entry.valid_until,
            version: 1,
        };

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let slot = select_slot(&tx, entry.day, entry.period)?;
        let candidate = Candidate {
            id: None,
            ..Candidate::from_entry(&entry)
        };
        check_admissible(&candidate, &slot).into_result()?;

        tx.execute(
            "INSERT INTO schedules (id, teacher_id, teacher_name, day, period, subject, class_name, updated_at, valid_until, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                entry.teacher_id,
                entry.teacher_name,
                entry.day.as_str(),
                entry.period.get(),
                entry.subject,
                entry.class_name,
                format_time(entry.updated_at),
                entry.valid_until.map(format_time),
                entry.version,
            ],
        )?;
        tx.commit()?;
        Ok(entry)
    }

    /// Applies a subject/class edit and returns the entry before and after.
    ///
    /// When `expected_version` is given and no longer matches the stored row the
    /// edit is refused with `WriteConflict` so the caller can re-read and retry.
    pub fn update_schedule(
        &self,
        schedule_id: &str,
        subject: Option<&str>,
        class_name: Option<&str>,
        expected_version: Option<i64>,
    ) -> AppResult<(ScheduleEntry, ScheduleEntry)> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = select_schedule(&tx, schedule_id)?
            .ok_or_else(|| AppError::NotFound(format!("Schedule {} not found", schedule_id)))?;

        if let Some(expected) = expected_version {
            if expected != before.version {
                return Err(AppError::WriteConflict(format!(
                    "Schedule {} was modified concurrently (expected version {}, found {})",
                    schedule_id, expected, before.version
                )));
            }
        }

        let mut after = before.clone();
        if let Some(subject) = subject {
            after.subject = subject.trim().to_string();
        }
        if let Some(class_name) = class_name {
            after.class_name = class_name.trim().to_string();
        }
        after.updated_at = now();
        after.version = before.version + 1;

        let slot = select_slot(&tx, after.day, after.period)?;
        check_admissible(&Candidate::from_entry(&after), &slot).into_result()?;

        let changed = tx.execute(
            "UPDATE schedules SET subject = ?1, class_name = ?2, updated_at = ?3, version = ?4
             WHERE id = ?5 AND version = ?6",
            params![
                after.subject,
                after.class_name,
                format_time(after.updated_at),
                after.version,
                schedule_id,
                before.version,
            ],
        )?;
        if changed == 0 {
            return Err(AppError::WriteConflict(format!(
                "Schedule {} was modified concurrently",
                schedule_id
            )));
        }
        tx.commit()?;
        Ok((before, after))
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> AppResult<bool> {
        let conn = self.connection()?;
        let deleted = conn.execute("DELETE FROM schedules WHERE id = ?1", [schedule_id])?;
        Ok(deleted > 0)
    }

    pub fn clear_schedules_and_change_logs(&self) -> AppResult<ClearReport> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let schedules_deleted = tx.execute("DELETE FROM schedules", [])?;
        let change_logs_deleted = tx.execute("DELETE FROM changelogs", [])?;
        tx.commit()?;
        Ok(ClearReport {
            schedules_deleted: schedules_deleted as u64,
            change_logs_deleted: change_logs_deleted as u64,
        })
    }

    // ─── Change log ───────────────────────────────────────────────────────────

    pub fn list_change_logs(&self, teacher_id: Option<&str>, limit: u32) -> AppResult<Vec<ChangeLogRecord>> {
        let conn = self.connection()?;
        let mut query = String::from(
            "SELECT id, schedule_id, teacher_id, teacher_name, day, period, old_value, new_value, changed_by, timestamp
             FROM changelogs",
        );
        let mut params_vec: Vec<String> = Vec::new();
        if let Some(teacher_id) = teacher_id {
            query.push_str(" WHERE teacher_id = ?");
            params_vec.push(teacher_id.to_string());
        }
        query.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_change_log_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ─── Break setting ────────────────────────────────────────────────────────

    /// Reads the break position, restoring the configured default when the row is gone.
    pub fn get_break_setting(&self) -> AppResult<BreakSetting> {
        if let Some(setting) = self.read_break_setting()? {
            return Ok(setting);
        }
        tracing::warn!("break setting row missing, restoring default");
        self.ensure_default_break_setting()?;
        self.read_break_setting()?
            .ok_or_else(|| AppError::Internal("break setting could not be restored".to_string()))
    }

    fn read_break_setting(&self) -> AppResult<Option<BreakSetting>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT break_after_period, updated_at FROM settings WHERE id = ?1",
                [BREAK_SETTINGS_ID],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((value, updated_at)) => Ok(Some(BreakSetting {
                break_after_period: u8::try_from(value).map_err(|_| {
                    AppError::Internal(format!("stored break setting {} is out of range", value))
                })?,
                updated_at: parse_time(&updated_at)?,
            })),
            None => Ok(None),
        }
    }

    /// Stores the break position. Domain validation is the caller's job.
    pub fn set_break_setting(&self, break_after_period: u8) -> AppResult<BreakSetting> {
        let updated_at = now();
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO settings (id, break_after_period, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET break_after_period = excluded.break_after_period, updated_at = excluded.updated_at",
            params![BREAK_SETTINGS_ID, break_after_period, format_time(updated_at)],
        )?;
        Ok(BreakSetting {
            break_after_period,
            updated_at,
        })
    }

    fn ensure_default_break_setting(&self) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (id, break_after_period, updated_at) VALUES (?1, ?2, ?3)",
            params![
                BREAK_SETTINGS_ID,
                self.default_break_after_period,
                format_time(now())
            ],
        )?;
        Ok(())
    }

    // ─── Change requests ──────────────────────────────────────────────────────

    pub fn insert_change_request(&self, request: &ChangeRequest) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO change_requests (
               id, teacher_id, teacher_name, day, period, requested_subject, requested_class, reason, status, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.id,
                request.teacher_id,
                request.teacher_name,
                request.day.as_str(),
                request.period.get(),
                request.requested_subject,
                request.requested_class,
                request.reason,
                request.status.as_str(),
                format_time(request.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_change_requests(&self, teacher_id: Option<&str>) -> AppResult<Vec<ChangeRequest>> {
        let conn = self.connection()?;
        let mut query = String::from(
            "SELECT id, teacher_id, teacher_name, day, period, requested_subject, requested_class, reason, status, created_at
             FROM change_requests",
        );
        let mut params_vec: Vec<String> = Vec::new();
        if let Some(teacher_id) = teacher_id {
            query.push_str(" WHERE teacher_id = ?");
            params_vec.push(teacher_id.to_string());
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                Ok(ChangeRequest {
                    id: row.get(0)?,
                    teacher_id: row.get(1)?,
                    teacher_name: row.get(2)?,
                    day: parse_day(&row.get::<_, String>(3)?)?,
                    period: parse_period(row.get(4)?)?,
                    requested_subject: row.get(5)?,
                    requested_class: row.get(6)?,
                    reason: row.get(7)?,
                    status: ChangeRequestStatus::Pending,
                    created_at: parse_time(&row.get::<_, String>(9)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Notifications ────────────────────────────────────────────────────────

    /// Records addressed to the principal directly or to their role, newest first.
    pub fn list_notifications(
        &self,
        principal: &Principal,
        category: Option<NotificationCategory>,
    ) -> AppResult<Vec<NotificationRecord>> {
        let conn = self.connection()?;
        let mut query = format!(
            "SELECT {} FROM notifications
             WHERE ((recipient_kind = 'user' AND recipient_id = ?) OR (recipient_kind = 'role' AND recipient_id = ?))",
            NOTIFICATION_COLUMNS
        );
        let mut params_vec: Vec<String> = vec![principal.id.clone(), principal.role.as_str().to_string()];
        if let Some(category) = category {
            query.push_str(" AND category = ?");
            params_vec.push(category.as_str().to_string());
        }
        query.push_str(&format!(" ORDER BY timestamp DESC LIMIT {}", NOTIFICATION_LIST_LIMIT));

        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(params_vec.iter()), parse_notification_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_notification_read(&self, notification_id: &str, principal: &Principal) -> AppResult<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE notifications SET read = 1
             WHERE id = ?1
               AND ((recipient_kind = 'user' AND recipient_id = ?2) OR (recipient_kind = 'role' AND recipient_id = ?3))",
            params![notification_id, principal.id, principal.role.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_category_read(&self, principal: &Principal, category: NotificationCategory) -> AppResult<u64> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE notifications SET read = 1
             WHERE category = ?1 AND read = 0
               AND ((recipient_kind = 'user' AND recipient_id = ?2) OR (recipient_kind = 'role' AND recipient_id = ?3))",
            params![category.as_str(), principal.id, principal.role.as_str()],
        )?;
        Ok(changed as u64)
    }

    #[cfg(test)]
    pub(crate) fn execute_for_test(&self, sql: &str) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn drop_change_log_table_for_test(&self) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute_batch("DROP TABLE changelogs;")?;
        Ok(())
    }

    fn ensure_schema_extensions(&self) -> AppResult<()> {
        let conn = self.connection()?;

        if !column_exists(&conn, "users", "designation")? {
            conn.execute("ALTER TABLE users ADD COLUMN designation TEXT", [])?;
            tracing::info!("added designation column to users table");
        }
        if !column_exists(&conn, "schedules", "valid_until")? {
            conn.execute("ALTER TABLE schedules ADD COLUMN valid_until TEXT", [])?;
            tracing::info!("added valid_until column to schedules table");
        }
        if !column_exists(&conn, "schedules", "version")? {
            conn.execute(
                "ALTER TABLE schedules ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
                [],
            )?;
            tracing::info!("added version column to schedules table");
        }

        for (index, columns) in SLOT_INDEXES {
            let statement = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON schedules({})",
                index, columns
            );
            if let Err(error) = conn.execute(&statement, []) {
                let collisions = slot_collisions(&conn, columns)?;
                tracing::warn!(
                    index,
                    error = %error,
                    collisions = ?collisions,
                    "existing schedules collide, unique slot index not created"
                );
            }
        }
        Ok(())
    }
}

const SLOT_INDEXES: [(&str, &str); 2] = [
    ("idx_schedules_class_slot", "day, period, class_name"),
    ("idx_schedules_teacher_slot", "teacher_id, day, period"),
];

/// Groups of schedule ids that share the given key columns.
fn slot_collisions(conn: &Connection, columns: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT group_concat(id, ',') FROM schedules GROUP BY {} HAVING COUNT(1) > 1",
        columns
    ))?;
    let groups = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(groups)
}

impl ChangeLogSink for Database {
    fn append_change(&self, record: &ChangeLogRecord) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO changelogs (id, schedule_id, teacher_id, teacher_name, day, period, old_value, new_value, changed_by, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.schedule_id,
                record.teacher_id,
                record.teacher_name,
                record.day.as_str(),
                record.period.get(),
                record.old_value,
                record.new_value,
                record.changed_by,
                format_time(record.timestamp),
            ],
        )?;
        Ok(())
    }
}

impl Mailbox for Database {
    fn deliver(&self, record: &NotificationRecord) -> AppResult<()> {
        let (recipient_kind, recipient_id) = match &record.recipient {
            Recipient::Role(role) => ("role", role.as_str().to_string()),
            Recipient::User(user_id) => ("user", user_id.clone()),
        };
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO notifications (
               id, category, title, message, from_user_id, from_user_name, recipient_kind, recipient_id, timestamp, read, metadata_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.category.as_str(),
                record.title,
                record.message,
                record.from_user_id,
                record.from_user_name,
                recipient_kind,
                recipient_id,
                format_time(record.timestamp),
                record.read,
                serde_json::to_string(&record.metadata)?,
            ],
        )?;
        Ok(())
    }
}

fn select_schedule(conn: &Connection, schedule_id: &str) -> AppResult<Option<ScheduleEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS),
        [schedule_id],
        parse_schedule_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn select_slot(conn: &Connection, day: Day, period: Period) -> AppResult<Vec<ScheduleEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM schedules WHERE day = ?1 AND period = ?2",
        SCHEDULE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![day.as_str(), period.get()], parse_schedule_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleEntry> {
    Ok(ScheduleEntry {
        id: row.get(0)?,
        teacher_id: row.get(1)?,
        teacher_name: row.get(2)?,
        day: parse_day(&row.get::<_, String>(3)?)?,
        period: parse_period(row.get(4)?)?,
        subject: row.get(5)?,
        class_name: row.get(6)?,
        updated_at: parse_time(&row.get::<_, String>(7)?)?,
        valid_until: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        version: row.get(9)?,
    })
}

fn parse_change_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeLogRecord> {
    Ok(ChangeLogRecord {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        teacher_id: row.get(2)?,
        teacher_name: row.get(3)?,
        day: parse_day(&row.get::<_, String>(4)?)?,
        period: parse_period(row.get(5)?)?,
        old_value: row.get(6)?,
        new_value: row.get(7)?,
        changed_by: row.get(8)?,
        timestamp: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        name: row.get(2)?,
        role: parse_role(&row.get::<_, String>(3)?)?,
        designation: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let recipient_kind: String = row.get(6)?;
    let recipient_id: String = row.get(7)?;
    let recipient = if recipient_kind == "role" {
        Recipient::Role(parse_role(&recipient_id)?)
    } else {
        Recipient::User(recipient_id)
    };
    let metadata_raw: String = row.get(10)?;
    let metadata = serde_json::from_str::<serde_json::Value>(&metadata_raw)
        .map_err(|error| conversion_error(format!("Invalid notification metadata: {}", error)))?;
    Ok(NotificationRecord {
        id: row.get(0)?,
        category: parse_category(&row.get::<_, String>(1)?)?,
        title: row.get(2)?,
        message: row.get(3)?,
        from_user_id: row.get(4)?,
        from_user_name: row.get(5)?,
        recipient,
        timestamp: parse_time(&row.get::<_, String>(8)?)?,
        read: row.get::<_, i32>(9)? != 0,
        metadata,
    })
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_day(raw: &str) -> rusqlite::Result<Day> {
    Day::parse(raw).ok_or_else(|| conversion_error(format!("Unknown day '{}'", raw)))
}

fn parse_period(raw: i64) -> rusqlite::Result<Period> {
    u8::try_from(raw)
        .ok()
        .and_then(Period::new)
        .ok_or_else(|| conversion_error(format!("Period {} out of range", raw)))
}

fn parse_category(raw: &str) -> rusqlite::Result<NotificationCategory> {
    NotificationCategory::parse(raw).ok_or_else(|| conversion_error(format!("Unknown notification category '{}'", raw)))
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    Role::parse(raw).ok_or_else(|| conversion_error(format!("Unknown role '{}'", raw)))
}

/// Current time at the precision the store keeps, so returned records equal re-read ones.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{Database, NewEntry};
    use crate::errors::AppError;
    use crate::journal::ChangeLogSink;
    use crate::models::{
        ChangeLogRecord, CreateUserPayload, Day, NotificationCategory, NotificationRecord, Period, Principal,
        Recipient, Role,
    };
    use crate::notify::Mailbox;
    use chrono::Utc;

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("test.db"), 3).expect("db")
    }

    fn new_entry(teacher_id: &str, day: Day, period: u8, subject: &str, class_name: &str) -> NewEntry {
        NewEntry {
            teacher_id: teacher_id.to_string(),
            teacher_name: format!("{} name", teacher_id),
            day,
            period: Period::new(period).expect("period"),
            subject: subject.to_string(),
            class_name: class_name.to_string(),
            valid_until: None,
        }
    }

    #[test]
    fn schedule_round_trip_keeps_all_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);

        let inserted = db
            .insert_schedule(&new_entry("t1", Day::Monday, 2, " Math ", "10-A"))
            .expect("insert");
        assert_eq!(inserted.subject, "Math");
        assert_eq!(inserted.version, 1);

        let loaded = db
            .get_schedule(&inserted.id)
            .expect("get")
            .expect("exists");
        assert_eq!(loaded, inserted);
        assert_eq!(db.list_schedules(Some("t1")).expect("list").len(), 1);
        assert!(db.list_schedules(Some("t2")).expect("list").is_empty());
    }

    #[test]
    fn insert_rejects_class_double_booking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.insert_schedule(&new_entry("t1", Day::Monday, 2, "Math", "10-A"))
            .expect("first insert");

        let error = db
            .insert_schedule(&new_entry("t2", Day::Monday, 2, "Science", "10-A"))
            .expect_err("conflict");
        assert!(matches!(error, AppError::Conflict(_)));
        assert_eq!(db.count_schedules().expect("count"), 1);
    }

    #[test]
    fn update_bumps_version_and_checks_expected_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let entry = db
            .insert_schedule(&new_entry("t1", Day::Tuesday, 4, "Geometry", "11B"))
            .expect("insert");

        let (before, after) = db
            .update_schedule(&entry.id, Some("Algebra"), None, Some(1))
            .expect("update");
        assert_eq!(before.subject, "Geometry");
        assert_eq!(after.subject, "Algebra");
        assert_eq!(after.version, 2);

        let stale = db
            .update_schedule(&entry.id, Some("Calculus"), None, Some(1))
            .expect_err("stale version");
        assert!(matches!(stale, AppError::WriteConflict(_)));

        let missing = db
            .update_schedule("missing", Some("Calculus"), None, None)
            .expect_err("missing");
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[test]
    fn update_into_a_booked_class_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.insert_schedule(&new_entry("t1", Day::Friday, 1, "History", "10A"))
            .expect("insert");
        let other = db
            .insert_schedule(&new_entry("t2", Day::Friday, 1, "Physics", "11A"))
            .expect("insert");

        let error = db
            .update_schedule(&other.id, None, Some("10A"), None)
            .expect_err("conflict");
        assert!(matches!(error, AppError::Conflict(_)));
        let unchanged = db.get_schedule(&other.id).expect("get").expect("exists");
        assert_eq!(unchanged.class_name, "11A");
        assert_eq!(unchanged.version, 1);
    }

    #[test]
    fn break_setting_defaults_and_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        assert_eq!(db.get_break_setting().expect("get").break_after_period, 3);
        db.set_break_setting(4).expect("set");
        assert_eq!(db.get_break_setting().expect("get").break_after_period, 4);

        drop(db);
        let reopened = open(&dir);
        assert_eq!(reopened.get_break_setting().expect("get").break_after_period, 4);
    }

    #[test]
    fn deleting_a_teacher_removes_their_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let teacher = db
            .insert_user(&CreateUserPayload {
                username: "t_amy".to_string(),
                name: "Amy Chen".to_string(),
                role: Role::Teacher,
                designation: None,
            })
            .expect("user");
        db.insert_schedule(&new_entry(&teacher.id, Day::Monday, 1, "Physics", "11A"))
            .expect("insert");

        let duplicate = db.insert_user(&CreateUserPayload {
            username: "t_amy".to_string(),
            name: "Someone Else".to_string(),
            role: Role::Teacher,
            designation: None,
        });
        assert!(matches!(duplicate, Err(AppError::Validation { .. })));

        assert_eq!(db.find_teachers_by_name(" Amy Chen ").expect("find").len(), 1);
        assert!(db.delete_user(&teacher.id).expect("delete"));
        assert!(!db.delete_user(&teacher.id).expect("delete again"));
        assert_eq!(db.count_schedules().expect("count"), 0);
    }

    #[test]
    fn clear_removes_entries_and_change_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let entry = db
            .insert_schedule(&new_entry("t1", Day::Monday, 1, "Eng", "9B"))
            .expect("insert");
        db.append_change(&ChangeLogRecord {
            id: "log-1".to_string(),
            schedule_id: entry.id.clone(),
            teacher_id: "t1".to_string(),
            teacher_name: "t1 name".to_string(),
            day: Day::Monday,
            period: entry.period,
            old_value: "Eng - 9B".to_string(),
            new_value: "Lit - 9B".to_string(),
            changed_by: "Administrator".to_string(),
            timestamp: Utc::now(),
        })
        .expect("append");
        assert_eq!(db.list_change_logs(Some("t1"), 100).expect("logs").len(), 1);

        let report = db.clear_schedules_and_change_logs().expect("clear");
        assert_eq!(report.schedules_deleted, 1);
        assert_eq!(report.change_logs_deleted, 1);
        assert!(db.list_change_logs(None, 100).expect("logs").is_empty());
    }

    #[test]
    fn notifications_are_scoped_to_recipient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let admin = Principal {
            id: "admin-1".to_string(),
            name: "Administrator".to_string(),
            role: Role::Admin,
        };
        let teacher = Principal {
            id: "teacher-1".to_string(),
            name: "Amy Chen".to_string(),
            role: Role::Teacher,
        };

        let record = |id: &str, category: NotificationCategory, recipient: Recipient| NotificationRecord {
            id: id.to_string(),
            category,
            title: "t".to_string(),
            message: "m".to_string(),
            from_user_id: "teacher-1".to_string(),
            from_user_name: "Amy Chen".to_string(),
            recipient,
            read: false,
            timestamp: Utc::now(),
            metadata: serde_json::json!({ "k": 1 }),
        };
        db.deliver(&record("n1", NotificationCategory::Requests, Recipient::Role(Role::Admin)))
            .expect("deliver");
        db.deliver(&record("n2", NotificationCategory::Security, Recipient::User("teacher-1".to_string())))
            .expect("deliver");

        let admin_inbox = db.list_notifications(&admin, None).expect("list");
        assert_eq!(admin_inbox.len(), 1);
        assert_eq!(admin_inbox[0].metadata["k"], 1);
        assert_eq!(db.list_notifications(&teacher, None).expect("list").len(), 1);
        assert!(db
            .list_notifications(&teacher, Some(NotificationCategory::Requests))
            .expect("list")
            .is_empty());

        assert!(!db.mark_notification_read("n1", &teacher).expect("foreign mark"));
        assert_eq!(
            db.mark_category_read(&admin, NotificationCategory::Requests)
                .expect("mark"),
            1
        );
        assert!(db.list_notifications(&admin, None).expect("list")[0].read);
    }

    #[test]
    fn missing_break_row_falls_back_to_the_configured_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db"), 4).expect("db");
        db.execute_for_test("DELETE FROM settings;").expect("delete setting");

        assert_eq!(db.get_break_setting().expect("get").break_after_period, 4);
        assert_eq!(db.get_break_setting().expect("get again").break_after_period, 4);
    }

    #[test]
    fn corrupt_notification_rows_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let admin = Principal {
            id: "admin-1".to_string(),
            name: "Administrator".to_string(),
            role: Role::Admin,
        };
        db.deliver(&NotificationRecord {
            id: "n1".to_string(),
            category: NotificationCategory::Requests,
            title: "t".to_string(),
            message: "m".to_string(),
            from_user_id: "teacher-1".to_string(),
            from_user_name: "Amy Chen".to_string(),
            recipient: Recipient::Role(Role::Admin),
            read: false,
            timestamp: Utc::now(),
            metadata: serde_json::json!({}),
        })
        .expect("deliver");

        db.execute_for_test("UPDATE notifications SET category = 'bogus';")
            .expect("corrupt category");
        assert!(db.list_notifications(&admin, None).is_err());

        db.execute_for_test("UPDATE notifications SET category = 'requests', metadata_json = '{not json';")
            .expect("corrupt metadata");
        assert!(db.list_notifications(&admin, None).is_err());
    }

    #[test]
    fn store_with_existing_double_booking_still_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.db");
        {
            let conn = rusqlite::Connection::open(&path).expect("open legacy");
            conn.execute_batch(super::SCHEMA_SQL).expect("schema");
            conn.execute_batch(
                "INSERT INTO schedules (id, teacher_id, teacher_name, day, period, subject, class_name, updated_at)
                 VALUES ('a', 't1', 'T1', 'Monday', 1, 'Eng', '9B', '2024-01-01T00:00:00.000000Z'),
                        ('b', 't2', 'T2', 'Monday', 1, 'Sci', '9B', '2024-01-01T00:00:00.000000Z');",
            )
            .expect("legacy rows");
        }

        let db = Database::new(&path, 3).expect("open despite collisions");
        assert_eq!(db.count_schedules().expect("count"), 2);
        assert_eq!(db.list_schedules(None).expect("list").len(), 2);
    }
}
