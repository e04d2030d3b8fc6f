//! Event wrappers for the two ingress paths: the chat server socket and
//! the inbound webhook server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde_json::Value;

/// A decoded frame from the chat server socket: a kind tag (`posted`,
/// `user_added`, ...) plus the opaque payload it arrived with.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub kind: String,
    pub body: Value,
}

impl RemoteEvent {
    /// Parse a raw socket frame. Returns `None` for frames without an
    /// `event` tag (sequence replies, pings) or undecodable JSON — those
    /// are expected noise, not errors.
    pub fn parse(raw: &str) -> Option<Self> {
        let body: Value = serde_json::from_str(raw).ok()?;
        let kind = body.get("event")?.as_str()?.to_string();
        Some(Self { kind, body })
    }
}

/// Which kind of channel a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// One-on-one channel with the bot.
    Direct,
    /// Any multi-party channel.
    Group,
}

/// Refined view of a `posted` event.
///
/// Constructed once per inbound frame and immutable afterwards. The server
/// delivers `data.post` and `data.mentions` as string-encoded JSON, so
/// refinement decodes them a second time.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub channel_kind: ChannelKind,
    pub text: String,
    pub sender_name: String,
    pub mentions: Vec<String>,
    pub root_id: String,
}

impl Message {
    /// Refine a `posted` event into a `Message`. Returns `None` when the
    /// payload doesn't carry a well-formed post.
    pub fn from_event(event: &RemoteEvent) -> Option<Self> {
        let data = event.body.get("data")?;
        let post: Value = serde_json::from_str(data.get("post")?.as_str()?).ok()?;
        let mentions: Vec<String> = data
            .get("mentions")
            .and_then(|m| m.as_str())
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        let channel_kind = match data.get("channel_type").and_then(|t| t.as_str()) {
            Some("D") => ChannelKind::Direct,
            _ => ChannelKind::Group,
        };

        Some(Self {
            id: str_field(&post, "id"),
            user_id: str_field(&post, "user_id"),
            channel_id: str_field(&post, "channel_id"),
            channel_name: str_field(data, "channel_name"),
            channel_kind,
            text: str_field(&post, "message").trim().to_string(),
            sender_name: str_field(data, "sender_name")
                .trim()
                .trim_start_matches('@')
                .to_string(),
            mentions,
            root_id: str_field(&post, "root_id"),
        })
    }

    /// Copy of this message with a leading self-mention stripped, so that
    /// `"@bot: hello"` and a direct-message `"hello"` match the same
    /// listener patterns.
    pub fn normalized(mut self, name_matcher: &Regex) -> Self {
        self.text = name_matcher.replace(&self.text, "").trim().to_string();
        self
    }

    pub fn is_direct_message(&self) -> bool {
        self.channel_kind == ChannelKind::Direct
    }

    /// Post id that a threaded reply should attach to: the thread root if
    /// this message is already part of a thread, otherwise the message itself.
    pub fn reply_id(&self) -> &str {
        if self.root_id.is_empty() {
            &self.id
        } else {
            &self.root_id
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// An inbound webhook POST, correlated back to its pending HTTP request
/// through `request_id` and routed to listeners through `webhook_id`.
#[derive(Debug)]
pub struct WebhookEvent {
    /// Correlation key: the platform trigger id for action callbacks, or a
    /// synthesized time+random id for plain webhooks.
    pub request_id: String,
    /// Routing key from the URL path, matched against listener patterns.
    pub webhook_id: String,
    /// The POST body.
    pub body: Value,
    /// Whether this was an interactive action (`trigger_id` present) rather
    /// than a plain webhook trigger.
    pub is_action: bool,
    responded: AtomicBool,
}

impl WebhookEvent {
    /// Wrap a webhook POST body. Action payloads reuse their `trigger_id`
    /// as the request id; plain webhooks get a generated one, unique enough
    /// in practice though not guaranteed collision-free.
    pub fn new(webhook_id: impl Into<String>, body: Value) -> Arc<Self> {
        let trigger_id = body
            .get("trigger_id")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        let is_action = trigger_id.is_some();
        let request_id = trigger_id.unwrap_or_else(|| {
            format!(
                "{}_{}",
                Utc::now().timestamp_micros(),
                rand::thread_rng().gen_range(0..10_000)
            )
        });
        Arc::new(Self {
            request_id,
            webhook_id: webhook_id.into(),
            body,
            is_action,
            responded: AtomicBool::new(false),
        })
    }

    /// Whether some listener already pushed a response for this event.
    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    /// Mark this event responded. Returns `true` if this call was the first
    /// to do so.
    pub fn mark_responded(&self) -> bool {
        !self.responded.swap(true, Ordering::SeqCst)
    }

    pub fn text(&self) -> Option<&str> {
        self.body.get("text").and_then(|t| t.as_str())
    }
}

/// What a webhook listener sends back to the pending HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub enum WebResponse {
    /// Sentinel: nobody will reply, complete the request with an empty 200.
    None,
    /// JSON body for the HTTP response.
    Json(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn posted_frame(message: &str, channel_type: &str, mentions: &str) -> String {
        json!({
            "event": "posted",
            "data": {
                "channel_name": "town-square",
                "channel_type": channel_type,
                "sender_name": "@alice",
                "mentions": mentions,
                "post": json!({
                    "id": "post1",
                    "user_id": "u_alice",
                    "channel_id": "ch1",
                    "message": message,
                    "root_id": "",
                })
                .to_string(),
            }
        })
        .to_string()
    }

    #[test]
    fn parse_posted_frame() {
        let raw = posted_frame("hello there", "O", r#"["u_bot"]"#);
        let event = RemoteEvent::parse(&raw).unwrap();
        assert_eq!(event.kind, "posted");

        let message = Message::from_event(&event).unwrap();
        assert_eq!(message.id, "post1");
        assert_eq!(message.text, "hello there");
        assert_eq!(message.sender_name, "alice");
        assert_eq!(message.mentions, vec!["u_bot".to_string()]);
        assert_eq!(message.channel_kind, ChannelKind::Group);
    }

    #[test]
    fn parse_drops_frames_without_event_tag() {
        assert!(RemoteEvent::parse(r#"{"seq_reply": 1}"#).is_none());
        assert!(RemoteEvent::parse("not json at all").is_none());
    }

    #[test]
    fn direct_channel_kind() {
        let raw = posted_frame("hi", "D", "[]");
        let event = RemoteEvent::parse(&raw).unwrap();
        let message = Message::from_event(&event).unwrap();
        assert!(message.is_direct_message());
    }

    #[test]
    fn missing_post_yields_none() {
        let event = RemoteEvent::parse(r#"{"event": "posted", "data": {}}"#).unwrap();
        assert!(Message::from_event(&event).is_none());
    }

    #[test]
    fn normalized_strips_self_mention() {
        let matcher = Regex::new(r"^@?bot[:,]?\s?").unwrap();
        let raw = posted_frame("@bot: hello", "O", r#"["u_bot"]"#);
        let event = RemoteEvent::parse(&raw).unwrap();
        let message = Message::from_event(&event).unwrap().normalized(&matcher);
        assert_eq!(message.text, "hello");

        let raw = posted_frame("hello", "D", "[]");
        let event = RemoteEvent::parse(&raw).unwrap();
        let message = Message::from_event(&event).unwrap().normalized(&matcher);
        assert_eq!(message.text, "hello");
    }

    #[test]
    fn reply_id_prefers_thread_root() {
        let mut message = Message {
            id: "post1".to_string(),
            user_id: String::new(),
            channel_id: String::new(),
            channel_name: String::new(),
            channel_kind: ChannelKind::Group,
            text: String::new(),
            sender_name: String::new(),
            mentions: Vec::new(),
            root_id: String::new(),
        };
        assert_eq!(message.reply_id(), "post1");
        message.root_id = "root9".to_string();
        assert_eq!(message.reply_id(), "root9");
    }

    #[test]
    fn webhook_event_reuses_trigger_id() {
        let event = WebhookEvent::new("deploy", json!({"trigger_id": "trig42"}));
        assert_eq!(event.request_id, "trig42");
        assert!(event.is_action);
    }

    #[test]
    fn webhook_event_synthesizes_request_id() {
        let event = WebhookEvent::new("deploy", json!({"text": "hi"}));
        assert!(!event.is_action);
        assert!(event.request_id.contains('_'));
        assert_eq!(event.text(), Some("hi"));
    }

    #[test]
    fn mark_responded_is_first_writer_wins() {
        let event = WebhookEvent::new("deploy", json!({}));
        assert!(!event.responded());
        assert!(event.mark_responded());
        assert!(!event.mark_responded());
        assert!(event.responded());
    }
}
