use std::sync::Arc;

use dashmap::DashMap;
use gw_common::DeliveryRequest;
use tracing::{debug, info};

use crate::adapter::{ChannelAdapter, DeliveryReceipt, NormalizedAdapter};
use crate::{ChannelError, Result};

/// Channel-name → adapter lookup for outbound sends.
#[derive(Default)]
pub struct OutboundRouter {
    adapters: DashMap<String, Arc<NormalizedAdapter>>,
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: ChannelAdapter) {
        let channel = adapter.channel.clone();
        info!(channel = %channel, "Registered outbound channel adapter");
        self.adapters
            .insert(channel, Arc::new(NormalizedAdapter::new(adapter)));
    }

    pub fn adapter(&self, channel: &str) -> Option<Arc<NormalizedAdapter>> {
        self.adapters.get(channel).map(|entry| entry.value().clone())
    }

    /// Whether the channel's adapter declared idempotent-send support.
    pub fn supports_idempotency_key(&self, channel: &str) -> bool {
        self.adapter(channel)
            .map(|adapter| adapter.supports_idempotency_key())
            .unwrap_or(false)
    }

    /// Deliver through the channel's adapter; unknown channels fail with the
    /// permanent not-configured error.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        let adapter = self
            .adapter(&request.channel)
            .ok_or_else(|| ChannelError::NotConfigured(request.channel.clone()))?;
        debug!(
            channel = %request.channel,
            target = %request.to,
            payloads = request.payloads.len(),
            "Dispatching outbound delivery"
        );
        adapter.send_final(request).await
    }
}
