//! Webhook fan-out.
//!
//! After every delivery attempt the dispatcher POSTs a signed snapshot of
//! the notification to each interested, active subscription. Fan-out is
//! best-effort: subscribers are dispatched concurrently, each bounded by the
//! configured timeout, and one subscriber's failure never affects another. The
//! dispatcher itself never retries; subscribers own their backfill.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_core::EngineConfig;

use crate::notification::{
    Channel, ChannelStatus, ContextTag, Notification, NotificationCategory,
    NotificationPriority, NotificationStatus, NotificationType,
};
use crate::store::NotificationStore;

type HmacSha256 = Hmac<Sha256>;

/// Webhook delivery errors, isolated per subscription.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("endpoint returned status {0}")]
    Status(u16),
    #[error("signing error: {0}")]
    Signing(String),
}

pub type WebhookResult<T> = Result<T, WebhookError>;

/// A third-party subscription to delivery events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    /// HMAC-SHA256 signing key for this subscriber.
    pub secret: String,
    /// Subscribed event list. Accepts an array, a delimited string, or a
    /// key/value map; empty or containing `*` subscribes to everything.
    pub events: serde_json::Value,
    /// Optional static `Authorization` header value.
    pub auth_header: Option<String>,
    pub active: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            secret: secret.into(),
            events: serde_json::Value::Array(Vec::new()),
            auth_header: None,
            active: true,
            success_count: 0,
            failure_count: 0,
            last_triggered: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_events(mut self, events: &[&str]) -> Self {
        self.events = serde_json::Value::Array(
            events
                .iter()
                .map(|e| serde_json::Value::String(e.to_string()))
                .collect(),
        );
        self
    }

    /// Normalize the subscribed-events field into an uppercase string set.
    pub fn event_set(&self) -> HashSet<String> {
        match &self.events {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(normalize_event)
                .filter(|e| !e.is_empty())
                .collect(),
            serde_json::Value::String(s) => s
                .split([',', ';', '|'])
                .map(normalize_event)
                .filter(|e| !e.is_empty())
                .collect(),
            serde_json::Value::Object(map) => map
                .iter()
                .filter(|(_, enabled)| value_is_truthy(enabled))
                .map(|(key, _)| normalize_event(key))
                .filter(|e| !e.is_empty())
                .collect(),
            _ => HashSet::new(),
        }
    }

    /// A subscription matches when its event set is empty, contains `*`,
    /// or contains the notification's type (case-insensitive).
    pub fn matches(&self, notification_type: NotificationType) -> bool {
        let events = self.event_set();
        events.is_empty()
            || events.contains("*")
            || events.contains(&notification_type.to_string())
    }
}

fn normalize_event(value: impl AsRef<str>) -> String {
    value.as_ref().trim().to_uppercase()
}

fn value_is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => {
            matches!(s.to_lowercase().as_str(), "true" | "1" | "yes")
        }
        _ => false,
    }
}

/// Hex-encoded HMAC-SHA256 signature of the raw request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> WebhookResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// An outgoing webhook POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// HTTP seam for the dispatcher; tests substitute a recording transport.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST the request and return the response status code.
    async fn post(&self, request: &WebhookRequest, timeout: Duration) -> WebhookResult<u16>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &WebhookRequest, timeout: Duration) -> WebhookResult<u16> {
        let mut builder = self.client.post(&request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Public-safe serialized notification record. Recipient addresses,
/// template variables, and free-form metadata are deliberately excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSnapshot {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub category: NotificationCategory,
    pub priority: NotificationPriority,
    pub status: NotificationStatus,
    pub channels: Vec<Channel>,
    pub channel_statuses: std::collections::HashMap<Channel, ChannelStatus>,
    pub retry_count: u32,
    pub context: Option<ContextTag>,
    pub created_at: DateTime<Utc>,
}

impl NotificationSnapshot {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            id: notification.id,
            notification_type: notification.notification_type,
            category: notification.category,
            priority: notification.priority,
            status: notification.status,
            channels: notification.channels.iter().copied().collect(),
            channel_statuses: notification
                .channels
                .iter()
                .map(|c| (*c, notification.channel_status(*c)))
                .collect(),
            retry_count: notification.retry_count,
            context: notification.context.clone(),
            created_at: notification.created_at,
        }
    }
}

/// Wire payload: `{ "notification": ..., "deliveredAt": "<ISO-8601>" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub notification: NotificationSnapshot,
    pub delivered_at: DateTime<Utc>,
}

/// Fans delivery events out to subscribed endpoints.
pub struct WebhookDispatcher {
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn WebhookTransport>,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn WebhookTransport>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            timeout: Duration::from_secs(config.webhook_timeout_secs),
        }
    }

    /// Dispatch the notification's current state to every matching active
    /// subscription, concurrently, awaiting all to completion. Failures
    /// are counted and logged, never propagated.
    pub async fn trigger_for_notification(&self, notification: &Notification) {
        let subscriptions = match self.store.active_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(error = %e, "failed to load webhook subscriptions");
                return;
            }
        };

        let event = WebhookEvent {
            notification: NotificationSnapshot::from_notification(notification),
            delivered_at: Utc::now(),
        };
        let body = match serde_json::to_string(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize webhook payload");
                return;
            }
        };
        let event_type = notification.notification_type.to_string();

        let dispatches = subscriptions
            .into_iter()
            .filter(|sub| sub.matches(notification.notification_type))
            .map(|sub| self.dispatch_one(sub, event_type.clone(), body.clone()));

        futures::future::join_all(dispatches).await;
    }

    async fn dispatch_one(&self, mut subscription: WebhookSubscription, event_type: String, body: String) {
        let result = self.post_signed(&subscription, &event_type, &body).await;

        match result {
            Ok(()) => {
                subscription.success_count += 1;
                subscription.last_triggered = Some(Utc::now());
                debug!(
                    subscription_id = %subscription.id,
                    url = %subscription.url,
                    event = %event_type,
                    "webhook delivered"
                );
            }
            Err(e) => {
                subscription.failure_count += 1;
                warn!(
                    subscription_id = %subscription.id,
                    url = %subscription.url,
                    event = %event_type,
                    error = %e,
                    "webhook delivery failed"
                );
            }
        }

        // Counters are observability only; a failed update is logged and
        // dropped.
        if let Err(e) = self.store.update_subscription(&subscription).await {
            warn!(subscription_id = %subscription.id, error = %e, "failed to update webhook counters");
        }
    }

    async fn post_signed(
        &self,
        subscription: &WebhookSubscription,
        event_type: &str,
        body: &str,
    ) -> WebhookResult<()> {
        let signature = sign_payload(&subscription.secret, body.as_bytes())?;

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Notification-Event".to_string(), event_type.to_string()),
            ("X-Notification-Signature".to_string(), signature),
        ];
        if let Some(auth) = &subscription.auth_header {
            headers.push(("Authorization".to_string(), auth.clone()));
        }

        let request = WebhookRequest {
            url: subscription.url.clone(),
            body: body.to_string(),
            headers,
        };

        let status = self.transport.post(&request, self.timeout).await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(WebhookError::Status(status))
        }
    }
}
