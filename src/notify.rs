//! Routes schedule and security events into recipient mailboxes.
//!
//! Dispatch happens after the primary write has been committed. The service
//! layer uses [`NotificationDispatcher::dispatch_best_effort`], so a mailbox
//! failure never turns a successful request into an error.

use crate::errors::AppResult;
use crate::models::{Day, NotificationCategory, NotificationRecord, Period, Principal, Recipient, Role};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    ScheduleChangeRequested {
        request_id: String,
        teacher: Principal,
        day: Day,
        period: Period,
        requested_subject: String,
        requested_class: String,
        reason: String,
    },
    PasswordChanged {
        user: Principal,
    },
}

impl NotificationEvent {
    pub fn category(&self) -> NotificationCategory {
        match self {
            Self::ScheduleChangeRequested { .. } => NotificationCategory::Requests,
            Self::PasswordChanged { .. } => NotificationCategory::Security,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self {
            Self::ScheduleChangeRequested { .. } => Recipient::Role(Role::Admin),
            Self::PasswordChanged { user } => Recipient::User(user.id.clone()),
        }
    }

    fn sender(&self) -> &Principal {
        match self {
            Self::ScheduleChangeRequested { teacher, .. } => teacher,
            Self::PasswordChanged { user } => user,
        }
    }
}

pub trait Mailbox: Send + Sync {
    fn deliver(&self, record: &NotificationRecord) -> AppResult<()>;
}

pub fn build_notification(event: &NotificationEvent, timestamp: DateTime<Utc>) -> NotificationRecord {
    let (title, message, metadata) = match event {
        NotificationEvent::ScheduleChangeRequested {
            request_id,
            teacher,
            day,
            period,
            requested_subject,
            requested_class,
            reason,
        } => (
            "Schedule change request".to_string(),
            format!(
                "{} requested {} - {} on {} period {}: {}",
                teacher.name, requested_subject, requested_class, day, period, reason
            ),
            serde_json::json!({
                "requestId": request_id,
                "day": day.as_str(),
                "period": period.get(),
                "requestedSubject": requested_subject,
                "requestedClass": requested_class,
                "reason": reason,
            }),
        ),
        NotificationEvent::PasswordChanged { user } => (
            "Password changed".to_string(),
            format!(
                "The password for {} was changed at {}. Contact an administrator if this was not you.",
                user.name,
                timestamp.format("%Y-%m-%d %H:%M UTC")
            ),
            serde_json::json!({}),
        ),
    };

    let sender = event.sender();
    NotificationRecord {
        id: Uuid::new_v4().to_string(),
        category: event.category(),
        title,
        message,
        from_user_id: sender.id.clone(),
        from_user_name: sender.name.clone(),
        recipient: event.recipient(),
        read: false,
        timestamp,
        metadata,
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    mailbox: Arc<dyn Mailbox>,
}

impl NotificationDispatcher {
    pub fn new(mailbox: Arc<dyn Mailbox>) -> Self {
        Self { mailbox }
    }

    pub fn dispatch(&self, event: NotificationEvent) -> AppResult<NotificationRecord> {
        let record = build_notification(&event, Utc::now());
        self.mailbox.deliver(&record)?;
        tracing::info!(
            notification_id = %record.id,
            category = record.category.as_str(),
            from = %record.from_user_name,
            "notification dispatched"
        );
        Ok(record)
    }

    pub fn dispatch_best_effort(&self, event: NotificationEvent) -> Option<NotificationRecord> {
        let category = event.category();
        match self.dispatch(event) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(
                    category = category.as_str(),
                    error = %error,
                    "notification delivery failed"
                );
                None
            }
        }
    }
}
