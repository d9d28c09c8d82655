//! Notification model: closed enumerations, per-channel state, and the
//! notification lifecycle.
//!
//! Status machine: `QUEUED -> SENDING -> {DELIVERED | PENDING | FAILED}`,
//! with `PENDING` looping back to `QUEUED` on re-enqueue. `DELIVERED`,
//! `FAILED`, and `CANCELLED` are terminal.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use courier_core::types::MetaMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A delivery medium.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    /// Channels that require an explicit destination address.
    pub fn requires_destination(&self) -> bool {
        !matches!(self, Self::InApp)
    }

    /// Parse a channel name, case-insensitively. Unknown names fall back
    /// to `IN_APP`.
    pub fn parse_or_default(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::InApp)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_token(value).as_str() {
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            "PUSH" => Some(Self::Push),
            "IN_APP" | "INAPP" => Some(Self::InApp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "EMAIL"),
            Self::Sms => write!(f, "SMS"),
            Self::Push => write!(f, "PUSH"),
            Self::InApp => write!(f, "IN_APP"),
        }
    }
}

/// Closed set of notification types the platform emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    NewMessage,
    PaymentCaptured,
    PaymentFailed,
    BookingConfirmed,
    BookingCancelled,
    AccountAlert,
    #[default]
    SystemAnnouncement,
    Reminder,
}

impl NotificationType {
    /// Parse a type name, case-insensitively. Unknown names fall back to
    /// `SYSTEM_ANNOUNCEMENT`.
    pub fn parse_or_default(value: &str) -> Self {
        Self::parse(value).unwrap_or_default()
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_token(value).as_str() {
            "NEW_MESSAGE" => Some(Self::NewMessage),
            "PAYMENT_CAPTURED" => Some(Self::PaymentCaptured),
            "PAYMENT_FAILED" => Some(Self::PaymentFailed),
            "BOOKING_CONFIRMED" => Some(Self::BookingConfirmed),
            "BOOKING_CANCELLED" => Some(Self::BookingCancelled),
            "ACCOUNT_ALERT" => Some(Self::AccountAlert),
            "SYSTEM_ANNOUNCEMENT" => Some(Self::SystemAnnouncement),
            "REMINDER" => Some(Self::Reminder),
            _ => None,
        }
    }

    /// The category this type belongs to.
    pub fn category(&self) -> NotificationCategory {
        match self {
            Self::NewMessage => NotificationCategory::Message,
            Self::PaymentCaptured | Self::PaymentFailed => NotificationCategory::Payment,
            Self::BookingConfirmed | Self::BookingCancelled => NotificationCategory::Booking,
            Self::AccountAlert => NotificationCategory::Account,
            Self::SystemAnnouncement | Self::Reminder => NotificationCategory::System,
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NewMessage => "NEW_MESSAGE",
            Self::PaymentCaptured => "PAYMENT_CAPTURED",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::BookingConfirmed => "BOOKING_CONFIRMED",
            Self::BookingCancelled => "BOOKING_CANCELLED",
            Self::AccountAlert => "ACCOUNT_ALERT",
            Self::SystemAnnouncement => "SYSTEM_ANNOUNCEMENT",
            Self::Reminder => "REMINDER",
        };
        write!(f, "{}", name)
    }
}

/// Coarse grouping of notification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationCategory {
    Message,
    Payment,
    Booking,
    Account,
    #[default]
    System,
}

impl NotificationCategory {
    pub fn parse(value: &str) -> Option<Self> {
        match normalize_token(value).as_str() {
            "MESSAGE" => Some(Self::Message),
            "PAYMENT" => Some(Self::Payment),
            "BOOKING" => Some(Self::Booking),
            "ACCOUNT" => Some(Self::Account),
            "SYSTEM" => Some(Self::System),
            _ => None,
        }
    }
}

/// Caller-declared urgency. Queue ordering itself is derived from how soon
/// a notification is due, not from this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    /// Parse a priority name. Unknown names fall back to `NORMAL`.
    pub fn parse_or_default(value: &str) -> Self {
        match normalize_token(value).as_str() {
            "LOW" => Self::Low,
            "NORMAL" => Self::Normal,
            "HIGH" => Self::High,
            "URGENT" => Self::Urgent,
            _ => Self::default(),
        }
    }
}

/// Overall notification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Queued,
    Sending,
    Pending,
    Delivered,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    /// Terminal states admit no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }
}

/// Per-channel delivery status, tracked independently of the overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    #[default]
    NotSent,
    Queued,
    Sent,
    Delivered,
    Failed,
}

/// Delivery state of one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ChannelState {
    pub fn delivered(now: DateTime<Utc>) -> Self {
        Self {
            status: ChannelStatus::Delivered,
            sent_at: Some(now),
            delivered_at: Some(now),
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ChannelStatus::Failed,
            sent_at: None,
            delivered_at: None,
            error: Some(reason.into()),
        }
    }
}

/// Tag linking a notification to the entity that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTag {
    pub entity_type: String,
    pub entity_id: String,
}

/// A notification owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    /// Recipient user, owner of the in-app view.
    pub recipient_id: Uuid,
    /// Destination address per channel (email address, phone number,
    /// push token). IN_APP needs none.
    pub addresses: HashMap<Channel, String>,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub category: NotificationCategory,
    pub priority: NotificationPriority,
    /// Requested channels; non-empty, insertion order irrelevant.
    pub channels: BTreeSet<Channel>,
    pub status: NotificationStatus,
    pub channel_states: HashMap<Channel, ChannelState>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub template_id: Option<Uuid>,
    pub variables: Option<MetaMap>,
    pub context: Option<ContextTag>,
    pub metadata: MetaMap,
    pub last_error: Option<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient_id: Uuid,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
        channels: BTreeSet<Channel>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            addresses: HashMap::new(),
            title: title.into(),
            message: message.into(),
            notification_type,
            category: notification_type.category(),
            priority: NotificationPriority::default(),
            channels,
            status: NotificationStatus::Queued,
            channel_states: HashMap::new(),
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            scheduled_for: None,
            template_id: None,
            variables: None,
            context: None,
            metadata: MetaMap::new(),
            last_error: None,
            read_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_address(mut self, channel: Channel, address: impl Into<String>) -> Self {
        self.addresses.insert(channel, address.into());
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_template(mut self, template_id: Uuid, variables: MetaMap) -> Self {
        self.template_id = Some(template_id);
        self.variables = Some(variables);
        self
    }

    pub fn with_context(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.context = Some(ContextTag {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        });
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Current state of one channel, defaulting to `NOT_SENT`.
    pub fn channel_status(&self, channel: Channel) -> ChannelStatus {
        self.channel_states
            .get(&channel)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn set_channel_state(&mut self, channel: Channel, state: ChannelState) {
        self.channel_states.insert(channel, state);
        self.updated_at = Utc::now();
    }

    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }

    pub fn mark_read(&mut self) {
        self.read_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

fn normalize_token(value: &str) -> String {
    value
        .trim()
        .to_uppercase()
        .replace(['-', ' '], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse("email"), Some(Channel::Email));
        assert_eq!(Channel::parse("In-App"), Some(Channel::InApp));
        assert_eq!(Channel::parse("IN_APP"), Some(Channel::InApp));
        assert_eq!(Channel::parse("fax"), None);
        assert_eq!(Channel::parse_or_default("fax"), Channel::InApp);
    }

    #[test]
    fn test_type_fallback_and_category() {
        assert_eq!(
            NotificationType::parse_or_default("payment_captured"),
            NotificationType::PaymentCaptured
        );
        assert_eq!(
            NotificationType::parse_or_default("totally-unknown"),
            NotificationType::SystemAnnouncement
        );
        assert_eq!(
            NotificationType::PaymentFailed.category(),
            NotificationCategory::Payment
        );
        assert_eq!(
            NotificationType::Reminder.category(),
            NotificationCategory::System
        );
    }

    #[test]
    fn test_priority_fallback() {
        assert_eq!(
            NotificationPriority::parse_or_default("urgent"),
            NotificationPriority::Urgent
        );
        assert_eq!(
            NotificationPriority::parse_or_default("???"),
            NotificationPriority::Normal
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(NotificationStatus::Delivered.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
        assert!(NotificationStatus::Cancelled.is_terminal());
        assert!(!NotificationStatus::Pending.is_terminal());
        assert!(!NotificationStatus::Sending.is_terminal());
    }

    #[test]
    fn test_channel_state_defaults_to_not_sent() {
        let n = Notification::new(
            Uuid::new_v4(),
            NotificationType::NewMessage,
            "Hi",
            "Body",
            BTreeSet::from([Channel::Email, Channel::InApp]),
        );
        assert_eq!(n.channel_status(Channel::Email), ChannelStatus::NotSent);
        assert!(n.is_unread());
    }

    #[test]
    fn test_wire_names_are_screaming_snake() {
        let json = serde_json::to_string(&NotificationType::PaymentCaptured).unwrap();
        assert_eq!(json, "\"PAYMENT_CAPTURED\"");
        let json = serde_json::to_string(&Channel::InApp).unwrap();
        assert_eq!(json, "\"IN_APP\"");
    }
}
