//! The event dispatch loop.
//!
//! One task owns both ingress queues (chat socket events and webhook
//! events), classifies and filters each item, and fans matched work out to
//! the runtime or the worker pool. Listener bodies never run inside this
//! loop.

use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::Settings;
use crate::error::PluginError;
use crate::models::{Message, RemoteEvent, WebResponse, WebhookEvent};
use crate::plugins::{ConstraintOutcome, Context, ExecMode, ListenerRegistry, MessageListener};

enum Inbound {
    Remote(RemoteEvent),
    Webhook(Arc<WebhookEvent>),
}

/// Routes inbound events to registered listeners.
pub struct EventDispatcher {
    registry: Arc<ListenerRegistry>,
    ctx: Context,
    ignore_users: Vec<String>,
    ignore_notifies: Vec<String>,
    ignore_own_messages: bool,
    suppress_denials: bool,
    name_matcher: Regex,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<ListenerRegistry>,
        ctx: Context,
        settings: &Settings,
    ) -> Result<Self, PluginError> {
        // Strips a leading self-mention so "@bot: ping" and a direct
        // message "ping" hit the same patterns.
        let pattern = format!(r"^@?{}[:,]?\s?", regex::escape(ctx.client.username()));
        let name_matcher = Regex::new(&pattern).map_err(|source| PluginError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;

        Ok(Self {
            registry,
            ctx,
            ignore_users: settings
                .ignore_users
                .iter()
                .map(|u| u.to_lowercase())
                .collect(),
            ignore_notifies: settings.ignore_notifies.clone(),
            ignore_own_messages: settings.ignore_own_messages,
            suppress_denials: settings.suppress_denials,
            name_matcher,
        })
    }

    /// Drain both ingress queues until both close.
    pub async fn run(
        self,
        events_rx: mpsc::UnboundedReceiver<RemoteEvent>,
        webhooks_rx: mpsc::UnboundedReceiver<Arc<WebhookEvent>>,
    ) {
        let remote = UnboundedReceiverStream::new(events_rx).map(Inbound::Remote);
        let web = UnboundedReceiverStream::new(webhooks_rx).map(Inbound::Webhook);
        let mut inbound = remote.merge(web);

        tracing::info!(
            message_listeners = self.registry.message_listener_count(),
            webhook_listeners = self.registry.webhook_listener_count(),
            "dispatcher running"
        );
        while let Some(item) = inbound.next().await {
            match item {
                Inbound::Remote(event) => self.handle_event(event).await,
                Inbound::Webhook(event) => self.handle_webhook(event).await,
            }
        }
        tracing::info!("dispatcher stopped");
    }

    async fn handle_event(&self, event: RemoteEvent) {
        if event.kind != "posted" {
            tracing::trace!(kind = %event.kind, "ignoring non-post event");
            return;
        }
        match Message::from_event(&event) {
            Some(message) => self.handle_post(message).await,
            None => tracing::debug!("dropping malformed posted event"),
        }
    }

    async fn handle_post(&self, message: Message) {
        if self.should_ignore(&message) {
            return;
        }
        let message = message.normalized(&self.name_matcher);
        let directed = message.is_direct_message()
            || message
                .mentions
                .iter()
                .any(|m| m == self.ctx.client.user_id());

        let mut matched = false;
        for listener in &self.registry.message_listeners {
            let Some(captures) = listener.pattern.captures(&message.text) else {
                continue;
            };
            // A pattern match counts even if constraints reject it below;
            // the fallback help reply is only for text nothing recognized.
            matched = true;

            match listener.check(&message, directed) {
                ConstraintOutcome::Pass => {}
                ConstraintOutcome::Skip => continue,
                ConstraintOutcome::Deny(denial) => {
                    if !self.suppress_denials
                        && let Err(e) = self.ctx.client.reply_to(&message, denial).await
                    {
                        tracing::error!(error = %e, "failed to send denial");
                    }
                    continue;
                }
            }

            let groups: Vec<String> = captures
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            self.dispatch(listener, message.clone(), groups);
        }

        if directed && !matched {
            let help = self.help_reply(&message.text);
            if let Err(e) = self.ctx.client.reply_to(&message, &help).await {
                tracing::error!(error = %e, "failed to send fallback reply");
            }
        }
    }

    fn should_ignore(&self, message: &Message) -> bool {
        if self.ignore_users.contains(&message.sender_name.to_lowercase()) {
            tracing::debug!(sender = %message.sender_name, "ignoring listed user");
            return true;
        }
        if self.ignore_own_messages && message.user_id == self.ctx.client.user_id() {
            return true;
        }
        if self
            .ignore_notifies
            .iter()
            .any(|n| message.text.contains(n.as_str()))
        {
            tracing::debug!(text = %message.text, "ignoring notify token");
            return true;
        }
        false
    }

    /// Run one matched listener: spawned for concurrent listeners, queued
    /// for pooled ones. Handler failures are reported back into the
    /// message's thread.
    fn dispatch(&self, listener: &MessageListener, message: Message, groups: Vec<String>) {
        let handler = Arc::clone(&listener.handler);
        let ctx = self.ctx.clone();
        let name = listener.name.clone();
        tracing::debug!(
            plugin = %listener.plugin,
            listener = %name,
            mode = ?listener.mode,
            "dispatching message listener"
        );

        let body = async move {
            if let Err(e) = handler(ctx.clone(), message.clone(), groups).await {
                tracing::error!(listener = %name, error = %e, "message listener failed");
                let report = format!(
                    "[{name}] I had a problem handling \"{}\"\n```\n{e:#}\n```",
                    message.text
                );
                if let Err(e) = ctx.client.reply_to(&message, &report).await {
                    tracing::error!(error = %e, "failed to report listener error");
                }
            }
        };
        match listener.mode {
            ExecMode::Concurrent => {
                tokio::spawn(body);
            }
            ExecMode::Pooled => {
                if let Err(e) = self.ctx.pool.add_task(body) {
                    tracing::warn!(error = %e, "could not queue pooled listener");
                }
            }
        }
    }

    /// Fallback for directed messages nothing matched: enumerate what the
    /// bot answers to, grouped by plugin, in a stable order.
    fn help_reply(&self, text: &str) -> String {
        let mut entries: Vec<(&str, &str, &str)> = self
            .registry
            .message_listeners
            .iter()
            .filter(|l| l.is_directed_listener())
            .map(|l| (l.plugin.as_str(), l.pattern.as_str(), l.description.as_str()))
            .collect();
        entries.sort_by_key(|(plugin, pattern, _)| {
            (
                plugin.to_string(),
                pattern
                    .chars()
                    .filter(|c| !c.is_ascii_punctuation())
                    .collect::<String>(),
            )
        });

        let mut reply = format!("Bad command \"{text}\". Here is what I understand:\n");
        let mut current_plugin = "";
        for (plugin, pattern, description) in entries {
            if plugin != current_plugin {
                reply.push_str(&format!("\nPlugin: **{plugin}**\n"));
                current_plugin = plugin;
            }
            reply.push_str(&format!("\t`{pattern}` - {description}\n"));
        }
        reply
    }

    /// Fan a webhook event out to every listener whose pattern matches its
    /// webhook id. Each handler is wrapped so the pending HTTP request is
    /// always completed, with the no-response sentinel if the handler never
    /// responded itself.
    async fn handle_webhook(&self, event: Arc<WebhookEvent>) {
        let matching: Vec<_> = self
            .registry
            .webhook_listeners
            .iter()
            .filter(|l| l.pattern.find(&event.webhook_id).is_some())
            .collect();

        if matching.is_empty() {
            tracing::debug!(webhook_id = %event.webhook_id, "no webhook listener matched");
            if let Err(e) = self
                .ctx
                .client
                .respond_to_web(&event, WebResponse::None)
                .await
            {
                tracing::error!(error = %e, "failed to complete unmatched webhook");
            }
            return;
        }

        for listener in matching {
            let handler = Arc::clone(&listener.handler);
            let ctx = self.ctx.clone();
            let event = Arc::clone(&event);
            let name = listener.name.clone();
            tracing::debug!(
                plugin = %listener.plugin,
                listener = %name,
                webhook_id = %event.webhook_id,
                "dispatching webhook listener"
            );
            tokio::spawn(async move {
                if let Err(e) = handler(ctx.clone(), Arc::clone(&event)).await {
                    tracing::error!(listener = %name, error = %e, "webhook listener failed");
                }
                if !event.responded()
                    && let Err(e) = ctx.client.respond_to_web(&event, WebResponse::None).await
                {
                    tracing::error!(error = %e, "failed to complete webhook");
                }
            });
        }
    }
}
