//! Plugins shipped with the crate: a liveness check and a pool status
//! report. Useful on their own and as small reference implementations.

use serde_json::json;

use super::{MessageListener, Plugin, WebhookListener};
use crate::models::WebResponse;

/// Replies "pong" when addressed with `ping`.
pub struct PingPlugin;

impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    fn message_listeners(&self) -> Vec<MessageListener> {
        vec![
            MessageListener::new("^ping$", |ctx, msg, _groups| async move {
                ctx.client.reply_to(&msg, "pong").await?;
                Ok(())
            })
            .expect("static pattern")
            .named("ping")
            .needs_mention()
            .describe("Replies with pong."),
        ]
    }
}

/// Reports worker pool occupancy when addressed with `busy`.
pub struct StatusPlugin;

impl Plugin for StatusPlugin {
    fn name(&self) -> &str {
        "status"
    }

    fn message_listeners(&self) -> Vec<MessageListener> {
        vec![
            MessageListener::new("^busy$", |ctx, msg, _groups| async move {
                let busy = ctx.busy_workers();
                ctx.client
                    .reply_to(&msg, &format!("{busy} of my workers are busy right now."))
                    .await?;
                Ok(())
            })
            .expect("static pattern")
            .named("busy")
            .needs_mention()
            .describe("Reports how many pool workers are busy."),
        ]
    }
}

/// Echoes webhook POSTs on `/hooks/echo` back to the caller.
pub struct WebhookEchoPlugin;

impl Plugin for WebhookEchoPlugin {
    fn name(&self) -> &str {
        "webhook-echo"
    }

    fn webhook_listeners(&self) -> Vec<WebhookListener> {
        vec![
            WebhookListener::new("^echo$", |ctx, event| async move {
                ctx.client
                    .respond_to_web(&event, WebResponse::Json(json!({"echo": event.body})))
                    .await?;
                Ok(())
            })
            .expect("static pattern")
            .named("echo"),
        ]
    }
}
