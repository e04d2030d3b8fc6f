//! Chat-bot core: event dispatch, plugin listeners, a shared worker pool,
//! job scheduling and an inbound webhook server.
//!
//! A [`Bot`] is assembled from [`Settings`], a [`RemoteClient`] transport
//! and a set of [`Plugin`]s. Two ingress paths feed one dispatch loop:
//! events read from the chat server socket, and HTTP POSTs accepted by the
//! webhook server. Matched listeners run either as spawned tasks or on the
//! shared [`pool::WorkerPool`], never inside the dispatch loop itself.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mattbot::plugins::bundled::PingPlugin;
//! use mattbot::transport::RestClient;
//! use mattbot::{Bot, Settings};
//!
//! # async fn start() -> anyhow::Result<()> {
//! let settings = Settings::from_env()?;
//! let client = Arc::new(RestClient::connect(&settings).await?);
//! let bot = Bot::new(settings, client, vec![Arc::new(PingPlugin)]);
//! bot.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bot;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod plugins;
pub mod pool;
pub mod scheduler;
pub mod transport;
pub mod webhook;

pub use bot::Bot;
pub use config::Settings;
pub use error::Error;
pub use models::{Message, RemoteEvent, WebResponse, WebhookEvent};
pub use plugins::{Context, MessageListener, Plugin, WebhookListener};
pub use transport::{RemoteClient, RestClient};
