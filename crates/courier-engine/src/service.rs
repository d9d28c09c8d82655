//! Public entry point: accept, cancel, read, and inspect notifications.
//!
//! `send` validates and persists, then hands off to the queue; callers get
//! the notification id back immediately while delivery proceeds in the
//! background. Unknown enum tokens in the input degrade to documented
//! defaults instead of rejecting the request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_core::{EngineConfig, MetaMap, ValidationErrors};

use crate::notification::{
    Channel, Notification, NotificationCategory, NotificationPriority, NotificationStatus,
    NotificationType,
};
use crate::queue::{QueueCoordinator, QueueError, QueueStats};
use crate::store::{NotificationStore, StoreError};

/// Service-level errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("notification not found: {0}")]
    NotFound(Uuid),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Input for submitting a notification. String-typed enum fields accept
/// any casing and fall back to defaults when unrecognized.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub recipient_id: Uuid,
    pub title: String,
    pub message: String,
    /// Defaults to SYSTEM_ANNOUNCEMENT when unrecognized.
    pub notification_type: String,
    /// Derived from the type when absent.
    pub category: Option<String>,
    /// Defaults to NORMAL when unrecognized.
    pub priority: Option<String>,
    /// Defaults to IN_APP per unrecognized token; empty is a validation
    /// error.
    pub channels: Vec<String>,
    /// Channel token to destination address.
    pub addresses: HashMap<String, String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub template_id: Option<Uuid>,
    pub variables: Option<MetaMap>,
    pub context: Option<(String, String)>,
    pub metadata: MetaMap,
    /// Overrides the configured default when set (floor 1).
    pub max_retries: Option<u32>,
}

impl SendOptions {
    pub fn new(
        recipient_id: Uuid,
        title: impl Into<String>,
        message: impl Into<String>,
        channels: Vec<String>,
    ) -> Self {
        Self {
            recipient_id,
            title: title.into(),
            message: message.into(),
            notification_type: String::new(),
            category: None,
            priority: None,
            channels,
            addresses: HashMap::new(),
            scheduled_for: None,
            template_id: None,
            variables: None,
            context: None,
            metadata: MetaMap::new(),
            max_retries: None,
        }
    }
}

/// Facade over the store and the queue coordinator.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    coordinator: Arc<QueueCoordinator>,
    config: EngineConfig,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        coordinator: Arc<QueueCoordinator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
        }
    }

    /// Start the background worker pool.
    pub async fn start(&self) {
        self.coordinator.start().await;
    }

    /// Stop the worker pool and wait for in-flight jobs.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    /// Validate, persist, and schedule a notification. Returns the id once
    /// the notification is durably accepted; delivery happens asynchronously.
    pub async fn send(&self, options: SendOptions) -> ServiceResult<Uuid> {
        validate_send(&options)?;

        let notification_type = NotificationType::parse_or_default(&options.notification_type);
        let category = options
            .category
            .as_deref()
            .and_then(NotificationCategory::parse)
            .unwrap_or_else(|| notification_type.category());
        let priority = options
            .priority
            .as_deref()
            .map(NotificationPriority::parse_or_default)
            .unwrap_or_default();

        let channels: BTreeSet<Channel> = options
            .channels
            .iter()
            .map(|token| Channel::parse_or_default(token))
            .collect();

        let mut notification = Notification::new(
            options.recipient_id,
            notification_type,
            options.title,
            options.message,
            channels,
        )
        .with_priority(priority);
        notification.category = category;
        notification.max_retries = options
            .max_retries
            .unwrap_or(self.config.default_max_retries)
            .max(1);
        notification.metadata = options.metadata;

        for (token, address) in options.addresses {
            match Channel::parse(&token) {
                Some(channel) => {
                    notification.addresses.insert(channel, address);
                }
                None => warn!(%token, "ignoring address for unknown channel"),
            }
        }

        if let Some(at) = options.scheduled_for {
            notification = notification.with_schedule(at);
        }
        if let Some(template_id) = options.template_id {
            notification =
                notification.with_template(template_id, options.variables.unwrap_or_default());
        }
        if let Some((entity_type, entity_id)) = options.context {
            notification = notification.with_context(entity_type, entity_id);
        }

        self.store.insert_notification(&notification).await?;

        let now = Utc::now();
        match notification.scheduled_for {
            Some(at) if at > now => {
                self.coordinator.enqueue(notification.id, Some(at)).await?;
                debug!(notification_id = %notification.id, scheduled_for = %at, "notification scheduled");
            }
            _ => {
                // Immediate path: deliver on a background task so the caller
                // returns as soon as the notification is durable.
                let coordinator = Arc::clone(&self.coordinator);
                let id = notification.id;
                tokio::spawn(async move {
                    if let Err(e) = coordinator.deliver_now(id).await {
                        warn!(notification_id = %id, error = %e, "background delivery failed");
                    }
                });
            }
        }

        Ok(notification.id)
    }

    /// Withdraw a queued or retry-pending notification. Terminal or
    /// mid-flight notifications are left alone and report `false`.
    pub async fn cancel(&self, id: Uuid) -> ServiceResult<bool> {
        let mut notification = self
            .store
            .get_notification(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;

        if !matches!(
            notification.status,
            NotificationStatus::Queued | NotificationStatus::Pending
        ) {
            return Ok(false);
        }

        self.coordinator.cancel(id).await?;
        notification.status = NotificationStatus::Cancelled;
        notification.next_retry_at = None;
        notification.updated_at = Utc::now();
        self.store.update_notification(&notification).await?;
        Ok(true)
    }

    /// Mark a notification read on behalf of its recipient. Reports `false`
    /// when the caller is not the recipient or it was already read.
    pub async fn mark_read(&self, id: Uuid, user_id: Uuid) -> ServiceResult<bool> {
        let mut notification = self
            .store
            .get_notification(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;

        if notification.recipient_id != user_id || !notification.is_unread() {
            return Ok(false);
        }
        notification.mark_read();
        self.store.update_notification(&notification).await?;
        Ok(true)
    }

    pub async fn get(&self, id: Uuid) -> ServiceResult<Option<Notification>> {
        Ok(self.store.get_notification(id).await?)
    }

    pub async fn list_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: usize,
    ) -> ServiceResult<Vec<Notification>> {
        Ok(self
            .store
            .list_for_recipient(recipient_id, unread_only, limit)
            .await?)
    }

    /// Run one delivery attempt inline, waiting for it to complete.
    pub async fn deliver(&self, id: Uuid) -> ServiceResult<()> {
        Ok(self.coordinator.deliver_now(id).await?)
    }

    pub async fn queue_stats(&self) -> ServiceResult<QueueStats> {
        Ok(self.coordinator.queue_stats().await?)
    }
}

fn validate_send(options: &SendOptions) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();
    if options.title.trim().is_empty() {
        errors.add("title", "can't be blank");
    }
    if options.message.trim().is_empty() {
        errors.add("message", "can't be blank");
    }
    if options.channels.is_empty() {
        errors.add("channels", "can't be blank");
    }
    errors.into_result()
}
