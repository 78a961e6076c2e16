use crate::config::ServiceConfig;
use crate::db::{Database, NewEntry};
use crate::demo;
use crate::errors::{AppError, AppResult};
use crate::grid::{is_allowed_break_position, resolve_slots, SlotLabel};
use crate::journal::{self, MutationKind};
use crate::models::{
    BreakSetting, ChangeLogRecord, ChangeRequest, ChangeRequestPayload, ChangeRequestReceipt, ChangeRequestStatus,
    ClearReport, CreateEntryPayload, CreateUserPayload, ExportRow, ImportReport, ListEntriesFilters,
    NotificationCategory, NotificationRecord, Principal, RawRow, Role, ScheduleEntry, UpdateEntryPayload,
    UpdateOutcome, UserRecord,
};
use crate::notify::{NotificationDispatcher, NotificationEvent};
use crate::recency::{classify, ClassifiedEntry, RecencyPolicy, ViewContext};
use crate::reconciler;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

const ADMIN_REQUIRED: &str = "Admin access required";

/// Entry point for every timetable operation.
///
/// Each call receives the authenticated principal and enforces role scoping
/// before touching the store.
pub struct TimetableService {
    db: Arc<Database>,
    notifications: NotificationDispatcher,
    config: ServiceConfig,
}

impl TimetableService {
    pub fn new(config: ServiceConfig) -> AppResult<Arc<Self>> {
        config.validate()?;
        let db = Arc::new(Database::new(
            &config.database_path(),
            config.default_break_after_period,
        )?);
        let notifications = NotificationDispatcher::new(db.clone());

        let this = Arc::new(Self {
            db,
            notifications,
            config,
        });

        if this.config.seed_demo_data {
            match demo::seed_if_empty(&this.db) {
                Ok(Some(report)) => {
                    tracing::info!(imported = report.imported_count, "seeded demo timetable");
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(error = %error, "failed to seed demo data"),
            }
        }

        Ok(this)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Identity used by maintenance tooling that runs outside a user session.
    pub fn system_principal() -> Principal {
        Principal {
            id: "system".to_string(),
            name: "System".to_string(),
            role: Role::Admin,
        }
    }

    // ─── Schedule entries ─────────────────────────────────────────────────────

    pub fn create_entry(&self, principal: &Principal, payload: CreateEntryPayload) -> AppResult<ScheduleEntry> {
        require_admin(principal)?;
        let teacher = self.require_teacher(&payload.teacher_id)?;

        let entry = self.db.insert_schedule(&NewEntry {
            teacher_id: teacher.id,
            teacher_name: teacher.name,
            day: payload.day,
            period: payload.period,
            subject: payload.subject,
            class_name: payload.class_name,
            valid_until: payload.valid_until,
        })?;
        tracing::info!(
            schedule_id = %entry.id,
            teacher_id = %entry.teacher_id,
            day = entry.day.as_str(),
            period = entry.period.get(),
            "schedule entry created"
        );
        Ok(entry)
    }

    pub fn update_entry(
        &self,
        principal: &Principal,
        schedule_id: &str,
        payload: UpdateEntryPayload,
    ) -> AppResult<UpdateOutcome> {
        require_admin(principal)?;
        let (before, after) = self.db.update_schedule(
            schedule_id,
            payload.subject.as_deref(),
            payload.class_name.as_deref(),
            payload.expected_version,
        )?;

        let change = journal::record_change(self.db.as_ref(), MutationKind::Update, principal, &before, &after);
        tracing::info!(
            schedule_id,
            version = after.version,
            journaled = change.is_some(),
            "schedule entry updated"
        );
        Ok(UpdateOutcome {
            entry: after,
            change,
        })
    }

    pub fn delete_entry(&self, principal: &Principal, schedule_id: &str) -> AppResult<()> {
        require_admin(principal)?;
        if !self.db.delete_schedule(schedule_id)? {
            return Err(AppError::NotFound("Schedule not found".to_string()));
        }
        tracing::info!(schedule_id, "schedule entry deleted");
        Ok(())
    }

    pub fn list_entries(&self, principal: &Principal, filters: ListEntriesFilters) -> AppResult<Vec<ScheduleEntry>> {
        let teacher_id = scoped_teacher_id(principal, filters.teacher_id);
        self.db.list_schedules(teacher_id.as_deref())
    }

    pub fn list_entries_with_recency(
        &self,
        principal: &Principal,
        filters: ListEntriesFilters,
        view: ViewContext,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ClassifiedEntry>> {
        let entries = self.list_entries(principal, filters)?;
        Ok(classify(entries, RecencyPolicy::for_view(view), now))
    }

    pub fn slot_layout(&self) -> AppResult<Vec<SlotLabel>> {
        let setting = self.db.get_break_setting()?;
        Ok(resolve_slots(setting.break_after_period))
    }

    // ─── Break setting ────────────────────────────────────────────────────────

    pub fn get_break_setting(&self) -> AppResult<BreakSetting> {
        self.db.get_break_setting()
    }

    pub fn set_break_setting(&self, principal: &Principal, break_after_period: u8) -> AppResult<BreakSetting> {
        require_admin(principal)?;
        if !is_allowed_break_position(break_after_period) {
            return Err(AppError::validation(
                "breakAfterPeriod",
                "Break can only be after period 3 or 4",
            ));
        }
        let setting = self.db.set_break_setting(break_after_period)?;
        tracing::info!(break_after_period, "break setting updated");
        Ok(setting)
    }

    // ─── Change log ───────────────────────────────────────────────────────────

    pub fn list_change_log(&self, principal: &Principal, teacher_id: Option<String>) -> AppResult<Vec<ChangeLogRecord>> {
        let teacher_id = scoped_teacher_id(principal, teacher_id);
        self.db
            .list_change_logs(teacher_id.as_deref(), self.config.change_log_limit)
    }

    // ─── Bulk operations ──────────────────────────────────────────────────────

    pub fn import_rows(&self, principal: &Principal, rows: &[RawRow]) -> AppResult<ImportReport> {
        require_admin(principal)?;
        reconciler::import_rows(&self.db, rows)
    }

    pub fn export_rows(&self, principal: &Principal) -> AppResult<Vec<ExportRow>> {
        require_admin(principal)?;
        reconciler::export_rows(&self.db)
    }

    pub fn clear_all(&self, principal: &Principal) -> AppResult<ClearReport> {
        require_admin(principal)?;
        reconciler::clear_all(&self.db)
    }

    pub fn load_demo_schedules(&self, principal: &Principal) -> AppResult<ImportReport> {
        require_admin(principal)?;
        demo::load_demo_schedules(&self.db)
    }

    // ─── Requests and notifications ───────────────────────────────────────────

    pub fn submit_change_request(
        &self,
        principal: &Principal,
        payload: ChangeRequestPayload,
    ) -> AppResult<ChangeRequestReceipt> {
        if principal.role != Role::Teacher {
            return Err(AppError::Forbidden(
                "Only teachers can request schedule changes".to_string(),
            ));
        }
        let requested_subject = require_text("requestedSubject", &payload.requested_subject)?;
        let requested_class = require_text("requestedClass", &payload.requested_class)?;
        let reason = require_text("reason", &payload.reason)?;

        let request = ChangeRequest {
            id: Uuid::new_v4().to_string(),
            teacher_id: principal.id.clone(),
            teacher_name: principal.name.clone(),
            day: payload.day,
            period: payload.period,
            requested_subject,
            requested_class,
            reason,
            status: ChangeRequestStatus::Pending,
            created_at: crate::db::now(),
        };
        self.db.insert_change_request(&request)?;

        let notification = self
            .notifications
            .dispatch_best_effort(NotificationEvent::ScheduleChangeRequested {
                request_id: request.id.clone(),
                teacher: principal.clone(),
                day: request.day,
                period: request.period,
                requested_subject: request.requested_subject.clone(),
                requested_class: request.requested_class.clone(),
                reason: request.reason.clone(),
            });
        Ok(ChangeRequestReceipt {
            request,
            notification,
        })
    }

    pub fn list_change_requests(&self, principal: &Principal) -> AppResult<Vec<ChangeRequest>> {
        let teacher_id = scoped_teacher_id(principal, None);
        self.db.list_change_requests(teacher_id.as_deref())
    }

    /// Credential storage lives with the auth provider; this only raises the
    /// security notice once it reports a successful change.
    pub fn record_password_changed(&self, principal: &Principal) -> Option<NotificationRecord> {
        self.notifications
            .dispatch_best_effort(NotificationEvent::PasswordChanged {
                user: principal.clone(),
            })
    }

    pub fn list_notifications(
        &self,
        principal: &Principal,
        category: Option<NotificationCategory>,
    ) -> AppResult<Vec<NotificationRecord>> {
        self.db.list_notifications(principal, category)
    }

    pub fn mark_notification_read(&self, principal: &Principal, notification_id: &str) -> AppResult<()> {
        if !self.db.mark_notification_read(notification_id, principal)? {
            return Err(AppError::NotFound("Notification not found".to_string()));
        }
        Ok(())
    }

    pub fn mark_category_read(&self, principal: &Principal, category: NotificationCategory) -> AppResult<u64> {
        self.db.mark_category_read(principal, category)
    }

    // ─── Users ────────────────────────────────────────────────────────────────

    pub fn create_user(&self, principal: &Principal, payload: CreateUserPayload) -> AppResult<UserRecord> {
        require_admin(principal)?;
        let user = self.db.insert_user(&payload)?;
        tracing::info!(user_id = %user.id, role = user.role.as_str(), "user created");
        Ok(user)
    }

    pub fn list_users(&self, principal: &Principal) -> AppResult<Vec<UserRecord>> {
        require_admin(principal)?;
        self.db.list_users()
    }

    pub fn delete_user(&self, principal: &Principal, user_id: &str) -> AppResult<()> {
        require_admin(principal)?;
        if !self.db.delete_user(user_id)? {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        Ok(())
    }

    fn require_teacher(&self, teacher_id: &str) -> AppResult<UserRecord> {
        match self.db.get_user(teacher_id)? {
            Some(user) if user.role == Role::Teacher => Ok(user),
            Some(_) => Err(AppError::validation("teacherId", "user is not a teacher")),
            None => Err(AppError::NotFound("Teacher not found".to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

fn require_admin(principal: &Principal) -> AppResult<()> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden(ADMIN_REQUIRED.to_string()))
    }
}

/// Teachers only ever see their own rows, whatever filter they send.
fn scoped_teacher_id(principal: &Principal, requested: Option<String>) -> Option<String> {
    match principal.role {
        Role::Teacher => Some(principal.id.clone()),
        Role::Admin => requested.filter(|value| !value.trim().is_empty()),
    }
}

fn require_text(field: &str, value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::TimetableService;
    use crate::config::ServiceConfig;
    use crate::errors::AppError;
    use crate::grid::SlotLabel;
    use crate::models::{
        ChangeRequestPayload, CreateEntryPayload, CreateUserPayload, Day, ListEntriesFilters, NotificationCategory,
        Period, Principal, Role, UpdateEntryPayload, UserRecord,
    };
    use crate::recency::ViewContext;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn service(dir: &tempfile::TempDir) -> Arc<TimetableService> {
        TimetableService::new(ServiceConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServiceConfig::default()
        })
        .expect("service")
    }

    fn admin() -> Principal {
        TimetableService::system_principal()
    }

    fn add_teacher(service: &TimetableService, username: &str, name: &str) -> UserRecord {
        service
            .create_user(
                &admin(),
                CreateUserPayload {
                    username: username.to_string(),
                    name: name.to_string(),
                    role: Role::Teacher,
                    designation: None,
                },
            )
            .expect("teacher")
    }

    fn entry_payload(teacher: &UserRecord, day: Day, period: u8, subject: &str, class_name: &str) -> CreateEntryPayload {
        CreateEntryPayload {
            teacher_id: teacher.id.clone(),
            day,
            period: Period::new(period).expect("period"),
            subject: subject.to_string(),
            class_name: class_name.to_string(),
            valid_until: None,
        }
    }

    #[test]
    fn class_conflict_is_rejected_and_nothing_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let math = add_teacher(&service, "t_math", "Math Teacher");
        let science = add_teacher(&service, "t_sci", "Science Teacher");

        service
            .create_entry(&admin(), entry_payload(&math, Day::Monday, 2, "Math", "10-A"))
            .expect("first entry");
        let error = service
            .create_entry(&admin(), entry_payload(&science, Day::Monday, 2, "Science", "10-A"))
            .expect_err("conflict");
        assert!(matches!(error, AppError::Conflict(_)));
        assert!(error.to_string().contains("10-A"));
        assert_eq!(
            service
                .list_entries(&admin(), ListEntriesFilters::default())
                .expect("list")
                .len(),
            1
        );
    }

    #[test]
    fn update_journals_old_and_new_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let math = add_teacher(&service, "t_math", "Math Teacher");
        let entry = service
            .create_entry(&admin(), entry_payload(&math, Day::Monday, 2, "Math", "10-A"))
            .expect("entry");

        let outcome = service
            .update_entry(
                &admin(),
                &entry.id,
                UpdateEntryPayload {
                    subject: Some("Algebra".to_string()),
                    ..UpdateEntryPayload::default()
                },
            )
            .expect("update");
        let change = outcome.change.expect("journal record");
        assert_eq!(change.old_value, "Math - 10-A");
        assert_eq!(change.new_value, "Algebra - 10-A");
        assert_eq!(change.changed_by, "System");

        let log = service.list_change_log(&admin(), None).expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], change);

        let teacher = math.as_principal();
        let recent = service
            .list_entries_with_recency(
                &teacher,
                ListEntriesFilters::default(),
                ViewContext::TeacherTimetable,
                Utc::now() + Duration::minutes(2),
            )
            .expect("recency");
        assert!(recent[0].recently_changed);
    }

    #[test]
    fn unchanged_update_leaves_no_journal_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let math = add_teacher(&service, "t_math", "Math Teacher");
        let entry = service
            .create_entry(&admin(), entry_payload(&math, Day::Monday, 2, "Math", "10-A"))
            .expect("entry");

        let outcome = service
            .update_entry(
                &admin(),
                &entry.id,
                UpdateEntryPayload {
                    subject: Some(" Math ".to_string()),
                    expected_version: Some(1),
                    ..UpdateEntryPayload::default()
                },
            )
            .expect("update");
        assert!(outcome.change.is_none());
        assert_eq!(outcome.entry.version, 2);
        assert!(service.list_change_log(&admin(), None).expect("log").is_empty());
    }

    #[test]
    fn journal_failure_does_not_undo_the_update() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let math = add_teacher(&service, "t_math", "Math Teacher");
        let entry = service
            .create_entry(&admin(), entry_payload(&math, Day::Monday, 2, "Math", "10-A"))
            .expect("entry");

        service
            .database()
            .drop_change_log_table_for_test()
            .expect("drop changelogs");

        let outcome = service
            .update_entry(
                &admin(),
                &entry.id,
                UpdateEntryPayload {
                    class_name: Some("10-B".to_string()),
                    ..UpdateEntryPayload::default()
                },
            )
            .expect("update still succeeds");
        assert!(outcome.change.is_none());
        assert_eq!(outcome.entry.class_name, "10-B");
    }

    #[test]
    fn teachers_are_limited_to_their_own_rows_and_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let amy = add_teacher(&service, "t_amy", "Amy Chen");
        let john = add_teacher(&service, "t_john", "John Smith");
        service
            .create_entry(&admin(), entry_payload(&amy, Day::Monday, 1, "Physics", "11A"))
            .expect("amy");
        service
            .create_entry(&admin(), entry_payload(&john, Day::Monday, 1, "English", "9A"))
            .expect("john");

        let amy_view = service
            .list_entries(
                &amy.as_principal(),
                ListEntriesFilters {
                    teacher_id: Some(john.id.clone()),
                },
            )
            .expect("list");
        assert_eq!(amy_view.len(), 1);
        assert_eq!(amy_view[0].teacher_id, amy.id);

        let forbidden = service
            .create_entry(&amy.as_principal(), entry_payload(&amy, Day::Tuesday, 1, "Physics", "11A"))
            .expect_err("teachers cannot write");
        assert!(matches!(forbidden, AppError::Forbidden(_)));
        assert!(matches!(
            service.set_break_setting(&amy.as_principal(), 4),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn break_setting_drives_the_slot_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);

        let layout = service.slot_layout().expect("layout");
        assert_eq!(layout[3], SlotLabel::Break { after: 3 });

        assert!(matches!(
            service.set_break_setting(&admin(), 5),
            Err(AppError::Validation { .. })
        ));
        service.set_break_setting(&admin(), 4).expect("set");
        let layout = service.slot_layout().expect("layout");
        assert_eq!(layout[4], SlotLabel::Break { after: 4 });
        assert_eq!(service.get_break_setting().expect("get").break_after_period, 4);
    }

    #[test]
    fn change_request_notifies_admins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let amy = add_teacher(&service, "t_amy", "Amy Chen");
        let payload = ChangeRequestPayload {
            day: Day::Thursday,
            period: Period::new(5).expect("period"),
            requested_subject: "Lab Session".to_string(),
            requested_class: "Grade 12A".to_string(),
            reason: "Lab booked for practicals".to_string(),
        };

        assert!(matches!(
            service.submit_change_request(&admin(), payload.clone()),
            Err(AppError::Forbidden(_))
        ));
        let blank = ChangeRequestPayload {
            reason: "  ".to_string(),
            ..payload.clone()
        };
        assert!(matches!(
            service.submit_change_request(&amy.as_principal(), blank),
            Err(AppError::Validation { .. })
        ));

        let receipt = service
            .submit_change_request(&amy.as_principal(), payload)
            .expect("request");
        let notification = receipt.notification.expect("notification");

        let inbox = service
            .list_notifications(&admin(), Some(NotificationCategory::Requests))
            .expect("inbox");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, notification.id);
        assert!(service
            .list_notifications(&amy.as_principal(), None)
            .expect("teacher inbox")
            .is_empty());
        assert_eq!(
            service
                .list_change_requests(&amy.as_principal())
                .expect("requests")
                .len(),
            1
        );

        service
            .mark_notification_read(&admin(), &notification.id)
            .expect("mark read");
        assert!(matches!(
            service.mark_notification_read(&admin(), "missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn password_change_raises_a_security_notice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let amy = add_teacher(&service, "t_amy", "Amy Chen");

        service
            .record_password_changed(&amy.as_principal())
            .expect("notification");
        assert_eq!(
            service
                .mark_category_read(&amy.as_principal(), NotificationCategory::Security)
                .expect("mark"),
            1
        );
    }

    #[test]
    fn deleting_a_teacher_removes_their_schedule() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let amy = add_teacher(&service, "t_amy", "Amy Chen");
        service
            .create_entry(&admin(), entry_payload(&amy, Day::Monday, 1, "Physics", "11A"))
            .expect("entry");

        service.delete_user(&admin(), &amy.id).expect("delete");
        assert!(service
            .list_entries(&admin(), ListEntriesFilters::default())
            .expect("list")
            .is_empty());
        assert!(matches!(
            service.delete_user(&admin(), &amy.id),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.create_entry(&admin(), entry_payload(&amy, Day::Monday, 1, "Physics", "11A")),
            Err(AppError::NotFound(_))
        ));
    }
}
