//! One delivery attempt over all of a notification's channels.
//!
//! Channels fail independently: one gateway's error never blocks the rest,
//! and a channel that already reached DELIVERED on an earlier attempt is not
//! sent again. The attempt as a whole counts as delivered when at least one
//! channel delivered this round; otherwise the retry scheduler decides
//! between another attempt and terminal failure. Every attempt ends with a
//! webhook fan-out of the resulting state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::EngineConfig;

use crate::channels::{ChannelError, ChannelResult, GatewayRegistry, RenderedContent};
use crate::notification::{Channel, ChannelState, ChannelStatus, Notification, NotificationStatus};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::{NotificationStore, StoreError};
use crate::template::TemplateRenderer;
use crate::webhook::WebhookDispatcher;

/// Delivery errors. Channel and gateway failures are not errors; they are
/// recorded on the notification and fed into the retry decision.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("notification not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// What the queue should do with the notification after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDisposition {
    /// Terminal success.
    Delivered,
    /// Attempt again at the given time.
    Retry(DateTime<Utc>),
    /// Terminal failure, retries exhausted.
    Failed,
    /// The notification was already terminal; nothing was attempted.
    Skipped,
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub disposition: DeliveryDisposition,
    /// Whether at least one channel delivered during this attempt.
    pub delivered: bool,
    /// Per-channel failure descriptions from this attempt.
    pub failures: Vec<String>,
}

/// Executes delivery attempts: renders content, dispatches to channel
/// gateways, settles retry state, and triggers webhooks.
pub struct DeliveryEngine {
    store: Arc<dyn NotificationStore>,
    gateways: GatewayRegistry,
    renderer: TemplateRenderer,
    retry: RetryScheduler,
    webhooks: Arc<WebhookDispatcher>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        gateways: GatewayRegistry,
        webhooks: Arc<WebhookDispatcher>,
        config: &EngineConfig,
    ) -> Self {
        let renderer = TemplateRenderer::new(store.clone());
        let retry = RetryScheduler::new(config.base_backoff_minutes);
        Self {
            store,
            gateways,
            renderer,
            retry,
            webhooks,
        }
    }

    /// Run one delivery attempt for the notification.
    pub async fn deliver(&self, notification_id: Uuid) -> DeliveryResult<DeliveryOutcome> {
        let mut notification = self
            .store
            .get_notification(notification_id)
            .await?
            .ok_or(DeliveryError::NotFound(notification_id))?;

        if notification.is_terminal() {
            debug!(%notification_id, status = ?notification.status, "skipping terminal notification");
            return Ok(DeliveryOutcome {
                disposition: DeliveryDisposition::Skipped,
                delivered: false,
                failures: Vec::new(),
            });
        }

        notification.status = NotificationStatus::Sending;
        notification.updated_at = Utc::now();
        self.store.update_notification(&notification).await?;

        let mut delivered_any = false;
        let mut failures = Vec::new();
        let channels: Vec<Channel> = notification.channels.iter().copied().collect();

        for channel in channels {
            // A channel delivered on an earlier attempt stays delivered.
            if notification.channel_status(channel) == ChannelStatus::Delivered {
                continue;
            }

            let content = self.render_for(&notification, channel).await;
            match self.send_one(&notification, channel, &content).await {
                Ok(()) => {
                    notification.set_channel_state(channel, ChannelState::delivered(Utc::now()));
                    delivered_any = true;
                }
                Err(e) => {
                    notification.set_channel_state(channel, ChannelState::failed(e.to_string()));
                    failures.push(format!("{channel}: {e}"));
                }
            }
        }

        notification.last_error = if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        };

        let decision = self.retry.settle(&mut notification, delivered_any, Utc::now());
        self.store.update_notification(&notification).await?;

        let disposition = match decision {
            RetryDecision::Delivered => {
                info!(%notification_id, "notification delivered");
                DeliveryDisposition::Delivered
            }
            RetryDecision::RetryAt(at) => {
                info!(
                    %notification_id,
                    retry_count = notification.retry_count,
                    retry_at = %at,
                    "delivery attempt failed, retry scheduled"
                );
                DeliveryDisposition::Retry(at)
            }
            RetryDecision::Exhausted => {
                warn!(
                    %notification_id,
                    retry_count = notification.retry_count,
                    error = notification.last_error.as_deref().unwrap_or(""),
                    "delivery failed terminally"
                );
                DeliveryDisposition::Failed
            }
        };

        // Observers see every attempt, not only the terminal ones.
        self.webhooks.trigger_for_notification(&notification).await;

        Ok(DeliveryOutcome {
            disposition,
            delivered: delivered_any,
            failures,
        })
    }

    /// Channel-specific content: the template when one is attached, the raw
    /// title/message otherwise. A render failure falls back to raw content
    /// rather than failing the channel.
    async fn render_for(&self, notification: &Notification, channel: Channel) -> RenderedContent {
        if let Some(template_id) = notification.template_id {
            let empty = courier_core::MetaMap::new();
            let variables = notification.variables.as_ref().unwrap_or(&empty);
            match self.renderer.render(template_id, variables, Some(channel)).await {
                Ok(content) => return content,
                Err(e) => {
                    warn!(
                        notification_id = %notification.id,
                        %template_id,
                        %channel,
                        error = %e,
                        "template render failed, using raw content"
                    );
                }
            }
        }
        RenderedContent::new(&notification.title, &notification.message)
    }

    async fn send_one(
        &self,
        notification: &Notification,
        channel: Channel,
        content: &RenderedContent,
    ) -> ChannelResult<()> {
        let destination = match notification.addresses.get(&channel) {
            Some(address) => address.clone(),
            // In-app delivery targets the recipient's own feed.
            None if !channel.requires_destination() => notification.recipient_id.to_string(),
            None => return Err(ChannelError::MissingDestination),
        };

        let sender = self.gateways.get(channel).ok_or(ChannelError::NoGateway)?;

        match sender.send(&destination, content).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChannelError::Declined),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::ChannelSender;
    use crate::notification::NotificationType;
    use crate::store::MemoryNotificationStore;
    use crate::template::Template;
    use crate::webhook::{WebhookRequest, WebhookResult, WebhookTransport};

    struct ScriptedSender {
        channel: Channel,
        succeed: bool,
        calls: AtomicUsize,
        last_content: Mutex<Option<RenderedContent>>,
    }

    impl ScriptedSender {
        fn new(channel: Channel, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                channel,
                succeed,
                calls: AtomicUsize::new(0),
                last_content: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChannelSender for ScriptedSender {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, _destination: &str, content: &RenderedContent) -> ChannelResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_content.lock().unwrap() = Some(content.clone());
            Ok(self.succeed)
        }
    }

    struct NullTransport;

    #[async_trait]
    impl WebhookTransport for NullTransport {
        async fn post(&self, _request: &WebhookRequest, _timeout: Duration) -> WebhookResult<u16> {
            Ok(200)
        }
    }

    fn engine_with(
        store: Arc<MemoryNotificationStore>,
        senders: Vec<Arc<dyn ChannelSender>>,
    ) -> DeliveryEngine {
        let mut gateways = GatewayRegistry::new().with_defaults();
        for sender in senders {
            gateways.register(sender);
        }
        let config = EngineConfig::default();
        let webhooks = Arc::new(WebhookDispatcher::new(
            store.clone(),
            Arc::new(NullTransport),
            &config,
        ));
        DeliveryEngine::new(store, gateways, webhooks, &config)
    }

    fn notification(channels: BTreeSet<Channel>) -> Notification {
        Notification::new(
            Uuid::new_v4(),
            NotificationType::NewMessage,
            "Hi",
            "Body",
            channels,
        )
    }

    #[tokio::test]
    async fn test_deliver_in_app_succeeds() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = notification(BTreeSet::from([Channel::InApp]));
        store.insert_notification(&n).await.unwrap();

        let engine = engine_with(store.clone(), vec![]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(outcome.disposition, DeliveryDisposition::Delivered);
        assert!(outcome.delivered);
        assert!(outcome.failures.is_empty());

        let stored = store.get_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Delivered);
        assert_eq!(stored.channel_status(Channel::InApp), ChannelStatus::Delivered);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_attempt_schedules_retry() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = notification(BTreeSet::from([Channel::Email]))
            .with_address(Channel::Email, "ann@example.com");
        store.insert_notification(&n).await.unwrap();

        let sender = ScriptedSender::new(Channel::Email, false);
        let engine = engine_with(store.clone(), vec![sender]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert!(matches!(outcome.disposition, DeliveryDisposition::Retry(_)));
        let stored = store.get_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_retry_at.is_some());
        assert_eq!(stored.last_error.as_deref(), Some("EMAIL: gateway declined"));
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let store = Arc::new(MemoryNotificationStore::new());
        let mut n = notification(BTreeSet::from([Channel::Email]))
            .with_address(Channel::Email, "ann@example.com");
        n.max_retries = 1;
        store.insert_notification(&n).await.unwrap();

        let sender = ScriptedSender::new(Channel::Email, false);
        let engine = engine_with(store.clone(), vec![sender]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(outcome.disposition, DeliveryDisposition::Failed);
        let stored = store.get_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_partial_delivery_counts_as_delivered() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = notification(BTreeSet::from([Channel::Email, Channel::InApp]))
            .with_address(Channel::Email, "ann@example.com");
        store.insert_notification(&n).await.unwrap();

        let sender = ScriptedSender::new(Channel::Email, false);
        let engine = engine_with(store.clone(), vec![sender]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(outcome.disposition, DeliveryDisposition::Delivered);
        let stored = store.get_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Delivered);
        assert_eq!(stored.channel_status(Channel::InApp), ChannelStatus::Delivered);
        assert_eq!(stored.channel_status(Channel::Email), ChannelStatus::Failed);
        // Failures stay visible even though the attempt succeeded overall.
        assert_eq!(stored.last_error.as_deref(), Some("EMAIL: gateway declined"));
    }

    #[tokio::test]
    async fn test_retry_skips_already_delivered_channels() {
        let store = Arc::new(MemoryNotificationStore::new());
        let mut n = notification(BTreeSet::from([Channel::Email, Channel::Sms]))
            .with_address(Channel::Email, "ann@example.com")
            .with_address(Channel::Sms, "+15550001111");
        n.set_channel_state(Channel::Email, ChannelState::delivered(Utc::now()));
        store.insert_notification(&n).await.unwrap();

        let email = ScriptedSender::new(Channel::Email, true);
        let sms = ScriptedSender::new(Channel::Sms, false);
        let engine = engine_with(store.clone(), vec![email.clone(), sms.clone()]);
        let outcome = engine.deliver(n.id).await.unwrap();

        // Email was not re-sent, and its earlier success does not count for
        // this attempt.
        assert_eq!(email.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sms.calls.load(Ordering::SeqCst), 1);
        assert!(!outcome.delivered);
        assert!(matches!(outcome.disposition, DeliveryDisposition::Retry(_)));
    }

    #[tokio::test]
    async fn test_missing_destination_fails_channel() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = notification(BTreeSet::from([Channel::Email]));
        store.insert_notification(&n).await.unwrap();

        let sender = ScriptedSender::new(Channel::Email, true);
        let engine = engine_with(store.clone(), vec![sender.clone()]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.failures, vec!["EMAIL: missing destination"]);
    }

    #[tokio::test]
    async fn test_unregistered_channel_fails_without_blocking_others() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = notification(BTreeSet::from([Channel::Sms, Channel::InApp]))
            .with_address(Channel::Sms, "+15550001111");
        store.insert_notification(&n).await.unwrap();

        let engine = engine_with(store.clone(), vec![]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(outcome.disposition, DeliveryDisposition::Delivered);
        assert_eq!(outcome.failures, vec!["SMS: no gateway configured"]);
    }

    #[tokio::test]
    async fn test_terminal_notification_is_skipped() {
        let store = Arc::new(MemoryNotificationStore::new());
        let mut n = notification(BTreeSet::from([Channel::InApp]));
        n.status = NotificationStatus::Cancelled;
        store.insert_notification(&n).await.unwrap();

        let engine = engine_with(store.clone(), vec![]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(outcome.disposition, DeliveryDisposition::Skipped);
        let stored = store.get_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_notification_errors() {
        let store = Arc::new(MemoryNotificationStore::new());
        let engine = engine_with(store, vec![]);
        let result = engine.deliver(Uuid::new_v4()).await;
        assert!(matches!(result, Err(DeliveryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_template_renders_channel_content() {
        let store = Arc::new(MemoryNotificationStore::new());
        let template = Template::new(
            "greeting",
            NotificationType::NewMessage,
            "Hello {{name}}",
            "You have mail, {{name}}.",
        );
        store.insert_template(&template).await.unwrap();

        let mut variables = courier_core::MetaMap::new();
        variables.insert("name".to_string(), "Ann".into());
        let n = notification(BTreeSet::from([Channel::Email]))
            .with_address(Channel::Email, "ann@example.com")
            .with_template(template.id, variables);
        store.insert_notification(&n).await.unwrap();

        let sender = ScriptedSender::new(Channel::Email, true);
        let engine = engine_with(store.clone(), vec![sender.clone()]);
        engine.deliver(n.id).await.unwrap();

        let content = sender.last_content.lock().unwrap().clone().unwrap();
        assert_eq!(content.title, "Hello Ann");
        assert_eq!(content.body, "You have mail, Ann.");
    }

    #[tokio::test]
    async fn test_render_failure_falls_back_to_raw_content() {
        let store = Arc::new(MemoryNotificationStore::new());
        let n = notification(BTreeSet::from([Channel::Email]))
            .with_address(Channel::Email, "ann@example.com")
            .with_template(Uuid::new_v4(), courier_core::MetaMap::new());
        store.insert_notification(&n).await.unwrap();

        let sender = ScriptedSender::new(Channel::Email, true);
        let engine = engine_with(store.clone(), vec![sender.clone()]);
        let outcome = engine.deliver(n.id).await.unwrap();

        assert_eq!(outcome.disposition, DeliveryDisposition::Delivered);
        let content = sender.last_content.lock().unwrap().clone().unwrap();
        assert_eq!(content.title, "Hi");
        assert_eq!(content.body, "Body");
    }
}
