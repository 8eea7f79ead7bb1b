//! Per-turn reply dispatching.
//!
//! The [`ReplyDispatcher`] sits between the reply generator and the delivery
//! machinery: it serializes emissions, persists final replies to the outbox
//! when a delivery-queue context is attached, tracks counters, and exposes a
//! quiesce point. The [`DispatchDriver`] orchestrates one whole turn around
//! it: admission, generation, drain, and turn finalization.

mod dispatcher;
mod driver;

pub use dispatcher::{
    DeliveryQueueContext, DirectSend, DispatchCounts, ReplyDispatcher,
};
pub use driver::{DispatchDriver, DispatchOutcome, DispatchPolicy, ReplyResolver};
