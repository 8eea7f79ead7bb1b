//! Outbound channel adapter contract.
//!
//! Channels plug in with one of three emission shapes: the current v2
//! `send_final`, or the legacy v1 `send_payload` / `send_text`+`send_media`
//! pairs. The normalizer wraps any of them behind an always-v2 surface so
//! the rest of the gateway only ever calls `send_final`.

mod adapter;
mod chunk;
mod router;

pub use adapter::{
    ChannelAdapter, DeliveryMode, DeliveryReceipt, Emitter, NormalizedAdapter, ResolveTarget,
    SendFinal, SendMedia, SendPayload, SendText,
};
pub use chunk::{chunk_text, ChunkerMode};
pub use router::OutboundRouter;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    /// No adapter registered for the channel. The error text doubles as the
    /// permanent-failure marker the outbox classifies on.
    #[error("outbound not configured for channel {0}")]
    NotConfigured(String),

    /// Provider rejected or failed the send; the text is classified by the
    /// outbox into permanent or transient.
    #[error("{0}")]
    Delivery(String),

    /// The caller cancelled an in-flight send. Treated as transient.
    #[error("delivery cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ChannelError>;
