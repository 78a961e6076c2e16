//! Built-in demo accounts and timetable.

use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{CreateUserPayload, Day, ImportReport, RawRow, Role, UserRecord};
use crate::reconciler;

pub const DEMO_ADMIN_USERNAME: &str = "admin123";

struct DemoTeacher {
    username: &'static str,
    name: &'static str,
    designation: &'static str,
    subjects: &'static [&'static str],
}

const DEMO_TEACHERS: [DemoTeacher; 4] = [
    DemoTeacher {
        username: "t_alex",
        name: "Alex Johnson",
        designation: "Mathematics",
        subjects: &["Mathematics", "Algebra", "Calculus", "Geometry", "Statistics"],
    },
    DemoTeacher {
        username: "t_amy",
        name: "Amy Chen",
        designation: "Science",
        subjects: &["Physics", "Chemistry", "Science", "Lab Session"],
    },
    DemoTeacher {
        username: "t_john",
        name: "John Smith",
        designation: "English",
        subjects: &["English", "English Literature", "Creative Writing", "Drama"],
    },
    DemoTeacher {
        username: "t_sara",
        name: "Sara Williams",
        designation: "Humanities",
        subjects: &["History", "Geography", "World History", "Economics", "Social Studies"],
    },
];

const DEMO_CLASSES: [&str; 8] = [
    "Grade 9A",
    "Grade 9B",
    "Grade 10A",
    "Grade 10B",
    "Grade 11A",
    "Grade 11B",
    "Grade 12A",
    "Grade 12B",
];

const DEMO_PERIODS: std::ops::RangeInclusive<usize> = 1..=6;

/// Creates the demo administrator and teachers that do not exist yet.
pub fn ensure_demo_users(db: &Database) -> AppResult<Vec<UserRecord>> {
    let mut users = Vec::new();
    let admin = CreateUserPayload {
        username: DEMO_ADMIN_USERNAME.to_string(),
        name: "Administrator".to_string(),
        role: Role::Admin,
        designation: None,
    };
    users.push(ensure_user(db, &admin)?);

    for teacher in &DEMO_TEACHERS {
        let payload = CreateUserPayload {
            username: teacher.username.to_string(),
            name: teacher.name.to_string(),
            role: Role::Teacher,
            designation: Some(teacher.designation.to_string()),
        };
        users.push(ensure_user(db, &payload)?);
    }
    Ok(users)
}

fn ensure_user(db: &Database, payload: &CreateUserPayload) -> AppResult<UserRecord> {
    if let Some(existing) = db.find_user_by_username(&payload.username)? {
        return Ok(existing);
    }
    let user = db.insert_user(payload)?;
    tracing::info!(username = %user.username, role = user.role.as_str(), "demo user created");
    Ok(user)
}

/// The demo week. Teachers are offset two classes apart so no class is ever
/// booked twice in a slot, and every teacher keeps one free period per day.
pub fn demo_rows() -> Vec<RawRow> {
    let mut rows = Vec::new();
    for (teacher_index, teacher) in DEMO_TEACHERS.iter().enumerate() {
        for day in Day::ALL {
            for period in DEMO_PERIODS {
                let turn = teacher_index + day.index() + period;
                if turn % DEMO_PERIODS.end() == 0 {
                    continue;
                }
                rows.push(RawRow {
                    teacher_name: teacher.name.to_string(),
                    day: day.as_str().to_string(),
                    period: period.to_string(),
                    subject: teacher.subjects[turn % teacher.subjects.len()].to_string(),
                    class_name: DEMO_CLASSES[(teacher_index * 2 + day.index() + period) % DEMO_CLASSES.len()]
                        .to_string(),
                });
            }
        }
    }
    rows
}

/// Replaces the timetable with the demo week. Change history is cleared too.
pub fn load_demo_schedules(db: &Database) -> AppResult<ImportReport> {
    ensure_demo_users(db)?;
    reconciler::clear_all(db)?;
    let report = reconciler::import_rows(db, &demo_rows())?;
    tracing::info!(imported = report.imported_count, "demo schedules loaded");
    Ok(report)
}

/// Seeds demo users, and the demo week when the timetable is empty.
pub fn seed_if_empty(db: &Database) -> AppResult<Option<ImportReport>> {
    ensure_demo_users(db)?;
    if db.count_schedules()? > 0 {
        return Ok(None);
    }
    load_demo_schedules(db).map(Some)
}

#[cfg(test)]
mod tests {
    use super::{demo_rows, load_demo_schedules, seed_if_empty, DEMO_ADMIN_USERNAME};
    use crate::db::Database;

    #[test]
    fn demo_week_loads_without_rejections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("demo.db"), 3).expect("db");

        let report = load_demo_schedules(&db).expect("load demo");
        assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
        assert_eq!(report.imported_count, demo_rows().len());
        assert!(db
            .find_user_by_username(DEMO_ADMIN_USERNAME)
            .expect("lookup")
            .is_some());
    }

    #[test]
    fn reloading_replaces_rather_than_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("demo.db"), 3).expect("db");

        load_demo_schedules(&db).expect("first load");
        let report = load_demo_schedules(&db).expect("second load");
        assert!(report.errors.is_empty());
        assert_eq!(db.count_schedules().expect("count") as usize, demo_rows().len());
        assert_eq!(db.count_users().expect("users"), 5);
    }

    #[test]
    fn seeding_skips_a_populated_timetable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("demo.db"), 3).expect("db");

        assert!(seed_if_empty(&db).expect("seed").is_some());
        assert!(seed_if_empty(&db).expect("seed again").is_none());
    }
}
