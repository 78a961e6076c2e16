//! Admissibility rules for schedule entries.
//!
//! The checker is a pure predicate over a candidate and the entries it could
//! collide with. Callers decide which entries to pass in (the whole week, a
//! single slot, or an import working set); the rules only look at matching
//! day and period.

use crate::errors::AppError;
use crate::models::{Day, Period, ScheduleEntry};
use std::fmt;

/// The fields of an entry that admission rules look at.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub id: Option<&'a str>,
    pub teacher_id: &'a str,
    pub day: Day,
    pub period: Period,
    pub subject: &'a str,
    pub class_name: &'a str,
}

impl<'a> Candidate<'a> {
    pub fn from_entry(entry: &'a ScheduleEntry) -> Self {
        Self {
            id: Some(entry.id.as_str()),
            teacher_id: &entry.teacher_id,
            day: entry.day,
            period: entry.period,
            subject: &entry.subject,
            class_name: &entry.class_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    EmptyField {
        field: &'static str,
    },
    ClassDoubleBooked {
        day: Day,
        period: Period,
        class_name: String,
        existing_id: String,
    },
    TeacherSlotTaken {
        day: Day,
        period: Period,
        teacher_name: String,
        existing_id: String,
    },
}

impl Rejection {
    pub fn is_conflict(&self) -> bool {
        !matches!(self, Self::EmptyField { .. })
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField { field } => write!(f, "{} must not be empty", field),
            Self::ClassDoubleBooked {
                day,
                period,
                class_name,
                ..
            } => write!(
                f,
                "Schedule conflict: class {} already has a lesson on {} period {}",
                class_name, day, period
            ),
            Self::TeacherSlotTaken {
                day,
                period,
                teacher_name,
                ..
            } => write!(
                f,
                "Schedule conflict: {} already teaches on {} period {}",
                teacher_name, day, period
            ),
        }
    }
}

impl From<Rejection> for AppError {
    fn from(value: Rejection) -> Self {
        match value {
            Rejection::EmptyField { field } => AppError::validation(field, "must not be empty"),
            other => AppError::Conflict(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(Rejection),
}

impl Admission {
    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Self::Admit => Ok(()),
            Self::Reject(rejection) => Err(rejection),
        }
    }
}

pub fn check_admissible<'e, I>(candidate: &Candidate<'_>, existing: I) -> Admission
where
    I: IntoIterator<Item = &'e ScheduleEntry>,
{
    if candidate.subject.trim().is_empty() {
        return Admission::Reject(Rejection::EmptyField { field: "subject" });
    }
    if candidate.class_name.trim().is_empty() {
        return Admission::Reject(Rejection::EmptyField { field: "className" });
    }

    let class_name = candidate.class_name.trim();
    let mut teacher_clash: Option<&ScheduleEntry> = None;

    for entry in existing {
        if candidate.id == Some(entry.id.as_str()) {
            continue;
        }
        if entry.day != candidate.day || entry.period != candidate.period {
            continue;
        }
        if entry.class_name == class_name {
            return Admission::Reject(Rejection::ClassDoubleBooked {
                day: entry.day,
                period: entry.period,
                class_name: entry.class_name.clone(),
                existing_id: entry.id.clone(),
            });
        }
        if entry.teacher_id == candidate.teacher_id && teacher_clash.is_none() {
            teacher_clash = Some(entry);
        }
    }

    // Class double-booking takes precedence so that it is reported even when
    // the same teacher also holds the slot.
    match teacher_clash {
        Some(entry) => Admission::Reject(Rejection::TeacherSlotTaken {
            day: entry.day,
            period: entry.period,
            teacher_name: entry.teacher_name.clone(),
            existing_id: entry.id.clone(),
        }),
        None => Admission::Admit,
    }
}
