//! Durable record of notifications, queue entries, webhook subscriptions,
//! and templates. The store holds no business logic; the engine components
//! mutate entities through it.
//!
//! All cross-job state lives here: workers share nothing in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::notification::Notification;
use crate::queue::{QueueEntry, QueueEntryStatus};
use crate::template::Template;
use crate::webhook::WebhookSubscription;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("notification not found: {0}")]
    NotificationNotFound(Uuid),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary for the engine. Collaborating CRUD surfaces reach
/// the entities only through this trait, never through engine internals.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()>;
    async fn get_notification(&self, id: Uuid) -> StoreResult<Option<Notification>>;
    async fn update_notification(&self, notification: &Notification) -> StoreResult<()>;
    /// Notifications for a recipient, newest first.
    async fn list_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: usize,
    ) -> StoreResult<Vec<Notification>>;

    /// Create or replace the queue entry for a notification. Entries are
    /// keyed by notification id, so at most one exists per notification;
    /// terminal entries stay around for audit.
    async fn upsert_queue_entry(&self, entry: &QueueEntry) -> StoreResult<()>;
    async fn get_queue_entry(&self, notification_id: Uuid) -> StoreResult<Option<QueueEntry>>;
    async fn queue_entry_counts(&self) -> StoreResult<HashMap<QueueEntryStatus, usize>>;

    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()>;
    async fn update_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()>;
    async fn active_subscriptions(&self) -> StoreResult<Vec<WebhookSubscription>>;

    async fn insert_template(&self, template: &Template) -> StoreResult<()>;
    async fn get_template(&self, id: Uuid) -> StoreResult<Option<Template>>;
    async fn get_template_by_key(&self, key: &str) -> StoreResult<Option<Template>>;
}

/// In-memory store for development and testing.
pub struct MemoryNotificationStore {
    notifications: RwLock<HashMap<Uuid, Notification>>,
    queue_entries: RwLock<HashMap<Uuid, QueueEntry>>,
    subscriptions: RwLock<HashMap<Uuid, WebhookSubscription>>,
    templates: RwLock<HashMap<Uuid, Template>>,
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            notifications: RwLock::new(HashMap::new()),
            queue_entries: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            templates: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert_notification(&self, notification: &Notification) -> StoreResult<()> {
        let mut notifications = self.notifications.write().await;
        notifications.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> StoreResult<Option<Notification>> {
        let notifications = self.notifications.read().await;
        Ok(notifications.get(&id).cloned())
    }

    async fn update_notification(&self, notification: &Notification) -> StoreResult<()> {
        let mut notifications = self.notifications.write().await;
        if !notifications.contains_key(&notification.id) {
            return Err(StoreError::NotificationNotFound(notification.id));
        }
        notifications.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn list_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: usize,
    ) -> StoreResult<Vec<Notification>> {
        let notifications = self.notifications.read().await;
        let mut matching: Vec<Notification> = notifications
            .values()
            .filter(|n| n.recipient_id == recipient_id)
            .filter(|n| !unread_only || n.is_unread())
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn upsert_queue_entry(&self, entry: &QueueEntry) -> StoreResult<()> {
        let mut entries = self.queue_entries.write().await;
        entries.insert(entry.notification_id, entry.clone());
        Ok(())
    }

    async fn get_queue_entry(&self, notification_id: Uuid) -> StoreResult<Option<QueueEntry>> {
        let entries = self.queue_entries.read().await;
        Ok(entries.get(&notification_id).cloned())
    }

    async fn queue_entry_counts(&self) -> StoreResult<HashMap<QueueEntryStatus, usize>> {
        let entries = self.queue_entries.read().await;
        let mut counts = HashMap::new();
        for entry in entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn insert_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn update_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn active_subscriptions(&self) -> StoreResult<Vec<WebhookSubscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn insert_template(&self, template: &Template) -> StoreResult<()> {
        let mut templates = self.templates.write().await;
        templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<Option<Template>> {
        let templates = self.templates.read().await;
        Ok(templates.get(&id).cloned())
    }

    async fn get_template_by_key(&self, key: &str) -> StoreResult<Option<Template>> {
        let templates = self.templates.read().await;
        Ok(templates.values().find(|t| t.key == key).cloned())
    }
}
