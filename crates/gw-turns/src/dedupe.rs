//! Dedupe key derivation and the in-memory admission fallback.

use dashmap::DashMap;
use gw_common::{now_ms, MsgContext};

/// Non-printable separator between key components.
const SEPARATOR: char = '\u{1f}';

/// Entries in the fallback cache live this long.
const FALLBACK_TTL_MS: i64 = 10 * 60 * 1000;

/// Derive the deterministic dedupe key for an inbound context.
///
/// Without a resolvable provider or a message id there is nothing stable to
/// key on, so the result is `None` and the turn cannot be deduplicated.
pub fn dedupe_key_for(ctx: &MsgContext) -> Option<String> {
    let provider = ctx.resolved_provider()?;
    let message_sid = ctx.message_sid.as_deref().filter(|s| !s.is_empty())?;

    let peer = ctx.resolved_peer().unwrap_or_default();
    let thread = ctx
        .thread_id
        .as_ref()
        .map(|t| t.as_key())
        .unwrap_or_default();

    let mut key = String::new();
    for (i, part) in [
        provider.as_str(),
        ctx.account_id.as_deref().unwrap_or_default(),
        ctx.session_key.as_str(),
        peer.as_str(),
        thread.as_str(),
        message_sid,
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            key.push(SEPARATOR);
        }
        key.push_str(part);
    }
    Some(key)
}

/// In-memory admission cache used when the database is unavailable.
///
/// Keyed by `(channel, account_id, external_id)`; entries expire after ten
/// minutes. Lost on restart, which only weakens dedupe while the database
/// stays down.
#[derive(Default)]
pub(crate) struct FallbackCache {
    entries: DashMap<String, i64>,
}

impl FallbackCache {
    /// Record the identity; returns false when it was already present and
    /// fresh (i.e. the turn is a duplicate).
    pub(crate) fn admit(&self, channel: &str, account_id: &str, external_id: &str) -> bool {
        let now = now_ms();
        self.entries.retain(|_, inserted| now - *inserted < FALLBACK_TTL_MS);

        let key = format!("{channel}{SEPARATOR}{account_id}{SEPARATOR}{external_id}");
        if let Some(inserted) = self.entries.get(&key) {
            if now - *inserted < FALLBACK_TTL_MS {
                return false;
            }
        }
        self.entries.insert(key, now);
        true
    }
}
