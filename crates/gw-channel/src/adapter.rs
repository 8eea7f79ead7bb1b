use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use gw_common::{DeliveryRequest, ReplyPayload};
use std::sync::OnceLock;
use tracing::warn;

use crate::chunk::{chunk_text, ChunkerMode};
use crate::Result;

/// How the channel reaches the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The adapter talks to the provider itself.
    #[default]
    Direct,
    /// The adapter hands off to an external gateway process.
    Gateway,
}

/// What a completed send reports back.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    /// Number of provider messages emitted.
    pub sent: usize,
    /// Provider-side id of the (last) message, when the provider returns one.
    pub provider_message_id: Option<String>,
}

/// v2 emission: one call delivers the whole final payload set.
#[async_trait]
pub trait SendFinal: Send + Sync {
    async fn send_final(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt>;
}

/// Legacy v1 emission: one opaque entry point.
#[async_trait]
pub trait SendPayload: Send + Sync {
    async fn send_payload(&self, request: &DeliveryRequest, payload: &ReplyPayload) -> Result<()>;
}

/// Legacy v1 emission: text primitive.
#[async_trait]
pub trait SendText: Send + Sync {
    async fn send_text(&self, request: &DeliveryRequest, text: &str) -> Result<()>;
}

/// Legacy v1 emission: media primitive.
#[async_trait]
pub trait SendMedia: Send + Sync {
    async fn send_media(&self, request: &DeliveryRequest, payload: &ReplyPayload) -> Result<()>;
}

/// Maps a logical destination to whatever the provider expects.
pub trait ResolveTarget: Send + Sync {
    fn resolve(&self, to: &str) -> String;
}

/// The emission shape a channel registered with.
#[derive(Clone)]
pub enum Emitter {
    Final(Arc<dyn SendFinal>),
    Payload(Arc<dyn SendPayload>),
    Split {
        text: Arc<dyn SendText>,
        media: Arc<dyn SendMedia>,
    },
}

impl Emitter {
    fn is_legacy(&self) -> bool {
        !matches!(self, Emitter::Final(_))
    }
}

/// Everything a channel declares about its outbound side.
#[derive(Clone)]
pub struct ChannelAdapter {
    pub channel: String,
    pub delivery_mode: DeliveryMode,
    pub chunker_mode: ChunkerMode,
    /// Maximum characters per text message; 0 disables chunking.
    pub text_chunk_limit: usize,
    pub poll_max_options: Option<usize>,
    /// When true the outbox attaches idempotency keys to this channel's rows.
    pub supports_idempotency_key: bool,
    pub resolve_target: Option<Arc<dyn ResolveTarget>>,
    pub emitter: Emitter,
}

impl ChannelAdapter {
    /// Minimal v2 adapter with defaults for the metadata fields.
    pub fn v2(channel: impl Into<String>, send_final: Arc<dyn SendFinal>) -> Self {
        Self {
            channel: channel.into(),
            delivery_mode: DeliveryMode::Direct,
            chunker_mode: ChunkerMode::Length,
            text_chunk_limit: 0,
            poll_max_options: None,
            supports_idempotency_key: false,
            resolve_target: None,
            emitter: Emitter::Final(send_final),
        }
    }
}

fn warned_channels() -> &'static DashSet<String> {
    static WARNED: OnceLock<DashSet<String>> = OnceLock::new();
    WARNED.get_or_init(DashSet::new)
}

/// Emit the one-time legacy warning; returns true only the first time per
/// channel.
fn warn_legacy_once(channel: &str) -> bool {
    if warned_channels().insert(channel.to_string()) {
        warn!(
            channel = %channel,
            "Channel registered a legacy v1 outbound adapter; sends are normalized to v2"
        );
        true
    } else {
        false
    }
}

/// An adapter normalized behind the v2 surface.
///
/// v1 emitters are synthesized into `send_final`: each payload takes the
/// media path when any media URL is set, otherwise the text path through the
/// channel's chunker.
pub struct NormalizedAdapter {
    inner: ChannelAdapter,
}

impl NormalizedAdapter {
    pub fn new(adapter: ChannelAdapter) -> Self {
        Self { inner: adapter }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.inner.delivery_mode
    }

    pub fn supports_idempotency_key(&self) -> bool {
        self.inner.supports_idempotency_key
    }

    pub fn poll_max_options(&self) -> Option<usize> {
        self.inner.poll_max_options
    }

    /// Deliver the request through whatever shape the channel registered.
    pub async fn send_final(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        if self.inner.emitter.is_legacy() {
            warn_legacy_once(&self.inner.channel);
        }

        let request = self.resolved(request);
        match &self.inner.emitter {
            Emitter::Final(sender) => sender.send_final(&request).await,
            Emitter::Payload(sender) => {
                let mut sent = 0;
                for payload in &request.payloads {
                    sender.send_payload(&request, payload).await?;
                    sent += 1;
                }
                Ok(DeliveryReceipt {
                    sent,
                    provider_message_id: None,
                })
            }
            Emitter::Split { text, media } => {
                let mut sent = 0;
                for payload in &request.payloads {
                    if payload.has_media() {
                        media.send_media(&request, payload).await?;
                        sent += 1;
                    } else if let Some(body) = payload.text.as_deref() {
                        for chunk in chunk_text(
                            body,
                            self.inner.text_chunk_limit,
                            self.inner.chunker_mode,
                        ) {
                            text.send_text(&request, &chunk).await?;
                            sent += 1;
                        }
                    }
                }
                Ok(DeliveryReceipt {
                    sent,
                    provider_message_id: None,
                })
            }
        }
    }

    fn resolved(&self, request: &DeliveryRequest) -> DeliveryRequest {
        let mut request = request.clone();
        if let Some(resolver) = &self.inner.resolve_target {
            request.to = resolver.resolve(&request.to);
        }
        request
    }
}

impl From<ChannelAdapter> for NormalizedAdapter {
    fn from(adapter: ChannelAdapter) -> Self {
        Self::new(adapter)
    }
}
