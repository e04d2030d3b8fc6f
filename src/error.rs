//! Error types for mattbot.

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the connection to the chat server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("No webhook server registered to receive the response")]
    NoResponseSink,
}

/// Errors from the inbound webhook server.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook server failed to start: {reason}")]
    StartupFailed { reason: String },
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is stopped and no longer accepts tasks")]
    Stopped,
}

/// Errors from plugin registration.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Invalid listener pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
