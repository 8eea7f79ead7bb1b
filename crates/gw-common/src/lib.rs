use chrono::Utc;
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Canonical Inbound Context
// ============================================================================

/// Thread identifiers arrive as strings from some providers and as integers
/// from others; both spellings must survive a serialize/hydrate round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThreadId {
    Number(i64),
    Text(String),
}

impl ThreadId {
    /// Stringified form used in dedupe keys and route columns.
    pub fn as_key(&self) -> String {
        match self {
            ThreadId::Number(n) => n.to_string(),
            ThreadId::Text(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadId::Number(n) => write!(f, "{}", n),
            ThreadId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Where a command-style inbound message came from.
///
/// `Native` marks interaction-scoped sources (one-shot provider callback
/// tokens). Their replies must never be replayed through the outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    #[default]
    Text,
    Native,
}

/// The canonical normalized inbound message context.
///
/// Canonical keys are PascalCase; hydration also accepts the legacy
/// lower-camelCase spellings via serde aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MsgContext {
    #[serde(alias = "body", skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(alias = "bodyForAgent", skip_serializing_if = "Option::is_none")]
    pub body_for_agent: Option<String>,
    #[serde(alias = "bodyForCommands", skip_serializing_if = "Option::is_none")]
    pub body_for_commands: Option<String>,
    #[serde(alias = "from", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(alias = "to", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(alias = "originatingChannel", skip_serializing_if = "Option::is_none")]
    pub originating_channel: Option<String>,
    #[serde(alias = "originatingTo", skip_serializing_if = "Option::is_none")]
    pub originating_to: Option<String>,
    #[serde(alias = "sessionKey")]
    pub session_key: String,
    #[serde(alias = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(alias = "messageSid", skip_serializing_if = "Option::is_none")]
    pub message_sid: Option<String>,
    #[serde(alias = "messageSidFull", skip_serializing_if = "Option::is_none")]
    pub message_sid_full: Option<String>,
    #[serde(alias = "replyToId", skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(alias = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(alias = "chatType", skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
    #[serde(alias = "provider", skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(alias = "surface", skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    #[serde(alias = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(alias = "senderName", skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(alias = "senderUsername", skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(alias = "senderE164", skip_serializing_if = "Option::is_none")]
    pub sender_e164: Option<String>,
    #[serde(alias = "commandAuthorized")]
    pub command_authorized: bool,
    #[serde(alias = "wasMentioned")]
    pub was_mentioned: bool,
    #[serde(alias = "isForum")]
    pub is_forum: bool,
    #[serde(alias = "commandSource")]
    pub command_source: CommandSource,
    #[serde(alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(alias = "heartbeat")]
    pub heartbeat: bool,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl MsgContext {
    /// Provider identity for dedupe and routing:
    /// originating channel, then provider, then surface, lowercased.
    pub fn resolved_provider(&self) -> Option<String> {
        non_empty(&self.originating_channel)
            .or_else(|| non_empty(&self.provider))
            .or_else(|| non_empty(&self.surface))
            .map(|s| s.to_lowercase())
    }

    /// Peer the reply should target: originating destination, then the
    /// channel-level to/from pair, then the session key.
    pub fn resolved_peer(&self) -> Option<String> {
        non_empty(&self.originating_to)
            .or_else(|| non_empty(&self.to))
            .or_else(|| non_empty(&self.from))
            .or_else(|| {
                let trimmed = self.session_key.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            })
            .map(str::to_string)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.heartbeat
    }
}

// ============================================================================
// Reply & Delivery Payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollPayload {
    pub question: String,
    pub options: Vec<String>,
}

/// One emitted reply unit. A payload carries text, media, or a poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplyPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// True when any media URL is set; the v1 normalizer uses this to pick
    /// the media primitive over the text primitive.
    pub fn has_media(&self) -> bool {
        self.media_url.is_some()
            || self
                .media_urls
                .as_ref()
                .is_some_and(|urls| !urls.is_empty())
    }
}

/// The serialized body of one outbox row: everything an outbound adapter
/// needs to deliver, with no access to the originating context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryRequest {
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub payloads: Vec<ReplyPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_effort: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gif_playback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<bool>,
}

/// Reply destination captured at turn admission, so resume never has to
/// re-derive it from the raw context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub channel: String,
    pub to: String,
    pub account_id: Option<String>,
    pub thread_id: Option<ThreadId>,
    pub reply_to_id: Option<String>,
}

impl RouteTarget {
    /// Derive the route from a normalized context. Returns `None` when no
    /// provider or peer can be resolved; such a context cannot be replied to.
    pub fn from_context(ctx: &MsgContext) -> Option<Self> {
        let channel = ctx.resolved_provider()?;
        let to = ctx.resolved_peer()?;
        Some(Self {
            channel,
            to,
            account_id: ctx.account_id.clone(),
            thread_id: ctx.thread_id.clone(),
            reply_to_id: ctx.reply_to_id.clone(),
        })
    }
}

// ============================================================================
// Clock & Id helpers
// ============================================================================

/// Wall-clock milliseconds. All persisted timestamps use this.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Opaque identifier for turns and outbox rows.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips_canonical_keys() {
        let ctx = MsgContext {
            body: Some("hello".to_string()),
            session_key: "agent:telegram:chat-1".to_string(),
            account_id: Some("acct-1".to_string()),
            message_sid: Some("msg-1".to_string()),
            provider: Some("Telegram".to_string()),
            thread_id: Some(ThreadId::Number(42)),
            command_source: CommandSource::Native,
            timestamp: Some(1_700_000_000_000),
            ..MsgContext::default()
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"Body\""));
        assert!(json.contains("\"SessionKey\""));
        let back: MsgContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn context_accepts_legacy_camel_case_keys() {
        let legacy = r#"{
            "body": "hi",
            "sessionKey": "agent:wa:+1555",
            "accountId": "acct-2",
            "messageSid": "sid-9",
            "originatingChannel": "WhatsApp",
            "threadId": "t-7",
            "commandSource": "text"
        }"#;
        let ctx: MsgContext = serde_json::from_str(legacy).unwrap();
        assert_eq!(ctx.body.as_deref(), Some("hi"));
        assert_eq!(ctx.session_key, "agent:wa:+1555");
        assert_eq!(ctx.resolved_provider().as_deref(), Some("whatsapp"));
        assert_eq!(ctx.thread_id, Some(ThreadId::Text("t-7".to_string())));
    }

    #[test]
    fn provider_resolution_order() {
        let mut ctx = MsgContext {
            surface: Some("Discord".to_string()),
            ..MsgContext::default()
        };
        assert_eq!(ctx.resolved_provider().as_deref(), Some("discord"));
        ctx.provider = Some("Slack".to_string());
        assert_eq!(ctx.resolved_provider().as_deref(), Some("slack"));
        ctx.originating_channel = Some(" Telegram ".to_string());
        assert_eq!(ctx.resolved_provider().as_deref(), Some("telegram"));
    }

    #[test]
    fn peer_falls_back_to_session_key() {
        let ctx = MsgContext {
            session_key: "agent:tg:chat-3".to_string(),
            ..MsgContext::default()
        };
        assert_eq!(ctx.resolved_peer().as_deref(), Some("agent:tg:chat-3"));
    }

    #[test]
    fn delivery_request_uses_camel_case_wire_keys() {
        let req = DeliveryRequest {
            channel: "telegram".to_string(),
            to: "chat-1".to_string(),
            payloads: vec![ReplyPayload::text("hi")],
            reply_to_id: Some("m-1".to_string()),
            ..DeliveryRequest::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"replyToId\""));
        assert!(!json.contains("\"bestEffort\""));
        let back: DeliveryRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn media_detection_covers_both_fields() {
        let mut payload = ReplyPayload::text("caption");
        assert!(!payload.has_media());
        payload.media_urls = Some(vec![]);
        assert!(!payload.has_media());
        payload.media_url = Some("https://example.test/a.png".to_string());
        assert!(payload.has_media());
    }
}
