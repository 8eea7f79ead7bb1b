//! Background workers.
//!
//! Two continuous loops keep the lifecycle honest after crashes: the
//! turn-worker replays turns that never reached a terminal state, and the
//! outbox-worker drains deliveries that are due for another attempt. Both
//! swallow per-item errors, account them on the rows, and prune terminal
//! state on every pass.

mod outbox_worker;
mod turn_worker;

pub use outbox_worker::{OutboxPassStats, OutboxWorker, OutboxWorkerConfig};
pub use turn_worker::{TurnPassStats, TurnWorker, TurnWorkerConfig};
