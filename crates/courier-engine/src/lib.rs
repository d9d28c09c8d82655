//! # courier-engine
//!
//! Asynchronous multi-channel notification delivery.
//!
//! ## Features
//!
//! - Durable delivery queue with priority and delayed scheduling
//! - Per-channel delivery state machine with exponential-backoff retries
//! - Pluggable channel gateways (email, SMS, push, in-app)
//! - Template rendering with variable substitution and conditional blocks
//! - Signed webhook fan-out to subscribed endpoints

pub mod channels;
pub mod delivery;
pub mod notification;
pub mod queue;
pub mod retry;
pub mod service;
pub mod store;
pub mod template;
pub mod webhook;

pub use channels::{ChannelError, ChannelSender, GatewayRegistry, RenderedContent};
pub use delivery::{DeliveryDisposition, DeliveryEngine, DeliveryError, DeliveryOutcome};
pub use notification::{
    Channel, ChannelState, ChannelStatus, Notification, NotificationCategory,
    NotificationPriority, NotificationStatus, NotificationType,
};
pub use queue::{
    DeliveryJob, DeliveryQueue, MemoryDeliveryQueue, QueueCoordinator, QueueEntry,
    QueueEntryStatus, QueueError, QueueStats,
};
pub use retry::{resolve_priority, RetryDecision, RetryScheduler};
pub use service::{NotificationService, SendOptions, ServiceError};
pub use store::{MemoryNotificationStore, NotificationStore, StoreError};
pub use template::{Template, TemplateDraft, TemplateError, TemplateRenderer};
pub use webhook::{
    HttpTransport, WebhookDispatcher, WebhookSubscription, WebhookTransport,
};
