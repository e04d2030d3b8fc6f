//! Typed plugin registration.
//!
//! Plugins declare their listeners explicitly through the [`Plugin`] trait;
//! a [`PluginManager`] composes them into one [`ListenerRegistry`] at
//! construction time. The registry is read-only afterwards and needs no
//! locking.

pub mod bundled;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;

use crate::error::PluginError;
use crate::models::{Message, WebhookEvent};
use crate::pool::WorkerPool;
use crate::transport::RemoteClient;

/// Denial sent when an allow-list constraint rejects a sender or channel.
pub const PERMISSION_DENIED: &str = "You do not have permission to perform this action!";

/// Handle given to every listener invocation.
#[derive(Clone)]
pub struct Context {
    /// Reply surface to the chat server.
    pub client: Arc<dyn RemoteClient>,
    /// The shared worker pool, exposed for introspection.
    pub pool: WorkerPool,
}

impl Context {
    pub fn new(client: Arc<dyn RemoteClient>, pool: WorkerPool) -> Self {
        Self { client, pool }
    }

    /// Number of pool workers currently executing work.
    pub fn busy_workers(&self) -> usize {
        self.pool.busy_workers()
    }
}

/// How a matched listener is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Spawned as a concurrent task on the runtime, fire-and-forget.
    #[default]
    Concurrent,
    /// Queued to the worker pool; suited to long or blocking work.
    Pooled,
}

/// Outcome of evaluating a listener's constraints against a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOutcome {
    /// All constraints hold; invoke the handler.
    Pass,
    /// Context constraint failed (wrong channel kind, no mention); skip
    /// silently.
    Skip,
    /// Allow-list constraint failed; reply with the denial message unless
    /// denials are suppressed.
    Deny(&'static str),
}

pub type MessageHandler =
    Arc<dyn Fn(Context, Message, Vec<String>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type WebhookHandler =
    Arc<dyn Fn(Context, Arc<WebhookEvent>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A registered message listener: pattern, handler, execution mode, and
/// the constraints checked before every invocation.
#[derive(Clone)]
pub struct MessageListener {
    pub(crate) name: String,
    pub(crate) plugin: String,
    pub(crate) description: String,
    pub(crate) pattern: Regex,
    pub(crate) mode: ExecMode,
    pub(crate) direct_only: bool,
    pub(crate) needs_mention: bool,
    pub(crate) allowed_users: Vec<String>,
    pub(crate) allowed_channels: Vec<String>,
    pub(crate) handler: MessageHandler,
}

impl MessageListener {
    /// Compile `pattern` and wrap `handler`. The pattern is *searched*
    /// against message text, not anchored; anchor explicitly with `^`/`$`
    /// where needed.
    pub fn new<F, Fut>(pattern: &str, handler: F) -> Result<Self, PluginError>
    where
        F: Fn(Context, Message, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let compiled = Regex::new(pattern).map_err(|source| PluginError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            name: pattern.to_string(),
            plugin: String::new(),
            description: String::new(),
            pattern: compiled,
            mode: ExecMode::Concurrent,
            direct_only: false,
            needs_mention: false,
            allowed_users: Vec::new(),
            allowed_channels: Vec::new(),
            handler: Arc::new(move |ctx, msg, groups| Box::pin(handler(ctx, msg, groups))),
        })
    }

    /// Name used in logs and error reports; defaults to the pattern.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// One-line description shown in the generated help reply.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Run this listener on the worker pool instead of spawning it.
    pub fn pooled(mut self) -> Self {
        self.mode = ExecMode::Pooled;
        self
    }

    /// Only fire for direct messages.
    pub fn direct_only(mut self) -> Self {
        self.direct_only = true;
        self
    }

    /// Only fire when the message is directed at the bot (direct message
    /// or explicit mention).
    pub fn needs_mention(mut self) -> Self {
        self.needs_mention = true;
        self
    }

    /// Restrict to the given senders (case-insensitive).
    pub fn allowed_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_users = users.into_iter().map(|u| u.as_ref().to_lowercase()).collect();
        self
    }

    /// Restrict to the given channels (case-insensitive channel names).
    pub fn allowed_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_channels = channels
            .into_iter()
            .map(|c| c.as_ref().to_lowercase())
            .collect();
        self
    }

    /// Evaluate constraints in order: direct-only, needs-mention,
    /// allowed-users, allowed-channels. The first failure decides the
    /// outcome; a failure here never counts as "no match".
    pub(crate) fn check(&self, message: &Message, directed: bool) -> ConstraintOutcome {
        if self.direct_only && !message.is_direct_message() {
            return ConstraintOutcome::Skip;
        }
        if self.needs_mention && !directed {
            return ConstraintOutcome::Skip;
        }
        if !self.allowed_users.is_empty()
            && !self.allowed_users.contains(&message.sender_name.to_lowercase())
        {
            return ConstraintOutcome::Deny(PERMISSION_DENIED);
        }
        if !self.allowed_channels.is_empty()
            && !message.is_direct_message()
            && !self
                .allowed_channels
                .contains(&message.channel_name.to_lowercase())
        {
            return ConstraintOutcome::Deny(PERMISSION_DENIED);
        }
        ConstraintOutcome::Pass
    }

    /// Whether this listener belongs in the generated help reply for
    /// directed messages.
    pub(crate) fn is_directed_listener(&self) -> bool {
        self.needs_mention || self.direct_only
    }
}

/// A registered webhook listener. The pattern is searched against the
/// webhook id from the URL path.
#[derive(Clone)]
pub struct WebhookListener {
    pub(crate) name: String,
    pub(crate) plugin: String,
    pub(crate) pattern: Regex,
    pub(crate) handler: WebhookHandler,
}

impl WebhookListener {
    pub fn new<F, Fut>(pattern: &str, handler: F) -> Result<Self, PluginError>
    where
        F: Fn(Context, Arc<WebhookEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let compiled = Regex::new(pattern).map_err(|source| PluginError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            name: pattern.to_string(),
            plugin: String::new(),
            pattern: compiled,
            handler: Arc::new(move |ctx, event| Box::pin(handler(ctx, event))),
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// A self-contained unit of bot behavior, registered explicitly.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn message_listeners(&self) -> Vec<MessageListener> {
        Vec::new()
    }

    fn webhook_listeners(&self) -> Vec<WebhookListener> {
        Vec::new()
    }

    /// Called once after the bot wires everything up.
    fn on_start(&self) {}

    /// Called once during shutdown.
    fn on_stop(&self) {}
}

/// All listeners from all plugins, flattened. Built once, never mutated.
#[derive(Default)]
pub struct ListenerRegistry {
    pub(crate) message_listeners: Vec<MessageListener>,
    pub(crate) webhook_listeners: Vec<WebhookListener>,
}

impl ListenerRegistry {
    pub fn message_listener_count(&self) -> usize {
        self.message_listeners.len()
    }

    pub fn webhook_listener_count(&self) -> usize {
        self.webhook_listeners.len()
    }
}

/// Owns the plugin set and composes their listeners into a registry.
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Flatten every plugin's listeners into one registry, stamping each
    /// listener with its originating plugin's name.
    pub fn build_registry(&self) -> ListenerRegistry {
        let mut registry = ListenerRegistry::default();
        for plugin in &self.plugins {
            for mut listener in plugin.message_listeners() {
                listener.plugin = plugin.name().to_string();
                tracing::debug!(
                    plugin = plugin.name(),
                    pattern = listener.pattern.as_str(),
                    "registered message listener"
                );
                registry.message_listeners.push(listener);
            }
            for mut listener in plugin.webhook_listeners() {
                listener.plugin = plugin.name().to_string();
                tracing::debug!(
                    plugin = plugin.name(),
                    pattern = listener.pattern.as_str(),
                    "registered webhook listener"
                );
                registry.webhook_listeners.push(listener);
            }
        }
        registry
    }

    pub fn start_all(&self) {
        for plugin in &self.plugins {
            plugin.on_start();
        }
    }

    pub fn stop_all(&self) {
        for plugin in &self.plugins {
            plugin.on_stop();
        }
    }
}
