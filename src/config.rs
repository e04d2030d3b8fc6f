//! Runtime settings, loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

/// Tunables for the bot core.
///
/// All values can be loaded from environment variables via [`Settings::from_env`],
/// or constructed directly (the common path in tests).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the chat server, e.g. `https://chat.example.com`.
    pub server_url: String,
    /// Port of the chat server API.
    pub server_port: u16,
    /// Personal access token used for both REST and WebSocket auth.
    pub bot_token: String,
    /// Whether to run the inbound webhook server.
    pub webhook_host_enabled: bool,
    /// Bind address for the webhook server.
    pub webhook_host: String,
    /// Bind port for the webhook server.
    pub webhook_port: u16,
    /// How long a webhook request waits for a listener response before
    /// resolving to 504.
    pub webhook_response_timeout: Duration,
    /// Senders whose messages are dropped entirely (case-insensitive).
    pub ignore_users: Vec<String>,
    /// Tokens that suppress a message when present in its text, e.g. `@all`.
    pub ignore_notifies: Vec<String>,
    /// Drop messages sent by the bot itself. Disable at your own risk:
    /// a listener replying with text that matches another listener will loop.
    pub ignore_own_messages: bool,
    /// Suppress the denial reply on failed user/channel allow-list checks.
    pub suppress_denials: bool,
    /// Number of workers in the shared pool.
    pub workers: usize,
    /// How often the scheduler pump checks for due jobs.
    pub scheduler_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "https://localhost".to_string(),
            server_port: 8065,
            bot_token: String::new(),
            webhook_host_enabled: false,
            webhook_host: "127.0.0.1".to_string(),
            webhook_port: 8579,
            webhook_response_timeout: Duration::from_secs(30),
            ignore_users: Vec::new(),
            ignore_notifies: vec!["@channel".to_string(), "@all".to_string()],
            ignore_own_messages: true,
            suppress_denials: false,
            workers: 10,
            scheduler_period: Duration::from_secs(1),
        }
    }
}

impl Settings {
    /// Load settings from the environment, reading a `.env` file if present.
    ///
    /// `MATTBOT_URL` and `MATTBOT_TOKEN` are required; everything else falls
    /// back to [`Settings::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Settings::default();

        Ok(Settings {
            server_url: require("MATTBOT_URL")?,
            server_port: parse_or("MATTBOT_PORT", defaults.server_port)?,
            bot_token: require("MATTBOT_TOKEN")?,
            webhook_host_enabled: parse_or(
                "MATTBOT_WEBHOOK_ENABLED",
                defaults.webhook_host_enabled,
            )?,
            webhook_host: var_or("MATTBOT_WEBHOOK_HOST", &defaults.webhook_host),
            webhook_port: parse_or("MATTBOT_WEBHOOK_PORT", defaults.webhook_port)?,
            webhook_response_timeout: Duration::from_secs(parse_or(
                "MATTBOT_WEBHOOK_TIMEOUT_SECS",
                defaults.webhook_response_timeout.as_secs(),
            )?),
            ignore_users: list_or("MATTBOT_IGNORE_USERS", defaults.ignore_users),
            ignore_notifies: list_or("MATTBOT_IGNORE_NOTIFIES", defaults.ignore_notifies),
            ignore_own_messages: parse_or(
                "MATTBOT_IGNORE_OWN_MESSAGES",
                defaults.ignore_own_messages,
            )?,
            suppress_denials: parse_or("MATTBOT_SUPPRESS_DENIALS", defaults.suppress_denials)?,
            workers: parse_or("MATTBOT_WORKERS", defaults.workers)?,
            scheduler_period: Duration::from_millis(parse_or(
                "MATTBOT_SCHEDULER_PERIOD_MS",
                defaults.scheduler_period.as_millis() as u64,
            )?),
        })
    }

    /// REST API base, e.g. `https://chat.example.com:8065/api/v4`.
    pub fn api_base(&self) -> String {
        format!("{}:{}/api/v4", self.server_url, self.server_port)
    }

    /// WebSocket endpoint derived from the server URL (`https` becomes `wss`).
    pub fn websocket_url(&self) -> String {
        let scheme_swapped = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("wss://{}", self.server_url)
        };
        format!("{}:{}/api/v4/websocket", scheme_swapped, self.server_port)
    }

    /// Socket address the webhook server binds to.
    pub fn webhook_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.webhook_host, self.webhook_port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "MATTBOT_WEBHOOK_HOST".to_string(),
                message: format!("{e}"),
            })
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn list_or(key: &str, default: Vec<String>) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or(default)
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}
