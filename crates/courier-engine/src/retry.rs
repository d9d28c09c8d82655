//! Retry scheduling: exponential backoff, attempt accounting, and queue
//! priority derived from urgency.

use chrono::{DateTime, Duration, Utc};

use crate::notification::{Notification, NotificationStatus};

/// Outcome of settling a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// At least one channel was delivered; the notification is terminal.
    Delivered,
    /// No channel was delivered; retry at the given time.
    RetryAt(DateTime<Utc>),
    /// Retries exhausted; the notification is terminally failed.
    Exhausted,
}

/// Decides whether a non-delivered notification is retried or finalized,
/// and computes queue priority from urgency.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    base_delay_minutes: i64,
}

impl RetryScheduler {
    pub fn new(base_delay_minutes: i64) -> Self {
        Self {
            base_delay_minutes: base_delay_minutes.max(1),
        }
    }

    /// Backoff before the given attempt: `2^attempt * base_delay_minutes`.
    ///
    /// The exponent is capped at 20 so pathological retry counts cannot
    /// overflow; delays grow strictly up to the cap (about ten years with
    /// the default base) and plateau beyond it.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_i64.pow(attempt.min(20));
        Duration::minutes(factor * self.base_delay_minutes)
    }

    /// Apply the attempt outcome to the notification and report what the
    /// queue should do next. `retry_count`, `next_retry_at`, and `status`
    /// are updated in place; the caller persists the notification.
    pub fn settle(
        &self,
        notification: &mut Notification,
        delivered: bool,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        notification.updated_at = now;

        if delivered {
            notification.status = NotificationStatus::Delivered;
            notification.next_retry_at = None;
            return RetryDecision::Delivered;
        }

        let attempt = notification.retry_count + 1;
        let max_retries = notification.max_retries.max(1);

        if attempt >= max_retries {
            notification.status = NotificationStatus::Failed;
            notification.retry_count = attempt;
            notification.next_retry_at = None;
            return RetryDecision::Exhausted;
        }

        let retry_at = now + self.backoff(attempt);
        notification.status = NotificationStatus::Pending;
        notification.retry_count = attempt;
        notification.next_retry_at = Some(retry_at);
        RetryDecision::RetryAt(retry_at)
    }
}

/// Queue priority bucket from minutes-until-due. Smaller numbers are served
/// first.
pub fn resolve_priority(scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> u8 {
    let minutes_until_due = (scheduled_for - now).num_minutes();
    if minutes_until_due <= 5 {
        1
    } else if minutes_until_due <= 30 {
        3
    } else if minutes_until_due <= 120 {
        5
    } else {
        8
    }
}
