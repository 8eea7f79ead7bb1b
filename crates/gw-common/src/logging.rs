//! Logging setup for the gateway.
//!
//! Every journal and worker tags its events with `turn_id` and `delivery_id`
//! fields, so one grep follows a message from admission through dispatch to
//! recovery. Keep those field names when adding spans around new call sites:
//!
//! ```rust,ignore
//! use tracing::Instrument;
//!
//! async fn handle(turn_id: &str) {
//!     do_work()
//!         .instrument(tracing::info_span!("dispatch", turn_id = %turn_id))
//!         .await;
//! }
//! ```
//!
//! `RUST_LOG` filters as usual (default: `info`). `LOG_FORMAT=json` switches
//! to flattened JSON events for log aggregation; anything else gets compact
//! human-readable output.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber for this process.
pub fn init_logging(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init();
    } else {
        builder.compact().init();
    }

    tracing::info!(service = %service_name, json_format = json, "Logging initialized");
}
