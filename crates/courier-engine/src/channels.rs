//! Channel gateway contract and dispatch table.
//!
//! Each delivery medium is a `ChannelSender` capability selected through a
//! registry keyed by channel, so adding a medium means registering one more
//! sender. A gateway error is treated identically to a `false` return; the
//! caller records it on that channel and moves on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::notification::Channel;

/// Channel send errors. The engine records these per channel; one
/// channel's error never propagates past it.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("gateway declined")]
    Declined,
    #[error("no gateway configured")]
    NoGateway,
    #[error("missing destination")]
    MissingDestination,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Rendered title/content pair handed to a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub title: String,
    pub body: String,
}

impl RenderedContent {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// One delivery medium. Externally supplied for EMAIL/SMS/PUSH; the
/// in-app sender is internal and always succeeds.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// Deliver content to a destination. `Ok(false)` and `Err(_)` are both
    /// failures from the engine's point of view.
    async fn send(&self, destination: &str, content: &RenderedContent) -> ChannelResult<bool>;
}

/// Dispatch table mapping channels to their senders.
pub struct GatewayRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            senders: HashMap::new(),
        }
    }

    /// Register the internal in-app sender.
    pub fn with_defaults(mut self) -> Self {
        self.register(Arc::new(InAppSender));
        self
    }

    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(sender.channel(), sender);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).cloned()
    }
}

/// In-app delivery is synchronous: the stored notification itself is the
/// delivery, so the send always succeeds.
pub struct InAppSender;

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, _destination: &str, _content: &RenderedContent) -> ChannelResult<bool> {
        Ok(true)
    }
}

/// Development sender that logs instead of delivering. One can be
/// registered per channel.
pub struct ConsoleSender {
    channel: Channel,
}

impl ConsoleSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for ConsoleSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, destination: &str, content: &RenderedContent) -> ChannelResult<bool> {
        tracing::info!(
            channel = %self.channel,
            destination = %destination,
            title = %content.title,
            "console delivery"
        );
        Ok(true)
    }
}
