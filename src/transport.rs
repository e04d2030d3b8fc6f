//! Chat server transport: the REST reply surface and the websocket event
//! listener.
//!
//! Listeners only ever see the [`RemoteClient`] trait, which keeps them
//! testable against an in-memory client and keeps the HTTP details out of
//! the dispatch path.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::config::Settings;
use crate::error::TransportError;
use crate::models::{Message, RemoteEvent, WebResponse, WebhookEvent};

/// Reply surface handed to every listener through its `Context`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// The bot's own account id, used to recognize mentions and own posts.
    fn user_id(&self) -> &str;

    /// The bot's login name, used to build the mention-stripping matcher.
    fn username(&self) -> &str;

    /// Post a message, optionally threaded under `root_id`.
    async fn create_post(
        &self,
        channel_id: &str,
        message: &str,
        root_id: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Add an emoji reaction to a post.
    async fn react_to(&self, post_id: &str, emoji_name: &str) -> Result<(), TransportError>;

    /// Wire up the channel that carries webhook responses back to the
    /// webhook server. Called once during bot startup.
    fn register_response_sink(&self, sink: mpsc::UnboundedSender<(String, WebResponse)>);

    /// Push a response toward the webhook server's pending request.
    fn send_web_response(
        &self,
        request_id: &str,
        response: WebResponse,
    ) -> Result<(), TransportError>;

    /// Reply in the same channel, threaded under the message's thread root.
    async fn reply_to(&self, message: &Message, text: &str) -> Result<(), TransportError> {
        self.create_post(&message.channel_id, text, Some(message.reply_id()))
            .await
    }

    /// Complete a pending webhook request. Only the first response per event
    /// is delivered; later calls are no-ops.
    async fn respond_to_web(
        &self,
        event: &WebhookEvent,
        response: WebResponse,
    ) -> Result<(), TransportError> {
        if !event.mark_responded() {
            tracing::debug!(request_id = %event.request_id, "webhook already responded, dropping");
            return Ok(());
        }
        self.send_web_response(&event.request_id, response)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Identity {
    #[serde(rename = "id")]
    user_id: String,
    username: String,
}

/// REST client for the chat server's HTTP API.
pub struct RestClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    me: Identity,
    response_sink: Mutex<Option<mpsc::UnboundedSender<(String, WebResponse)>>>,
}

impl RestClient {
    /// Build a client and verify the token by fetching the bot's own
    /// account.
    pub async fn connect(settings: &Settings) -> Result<Self, TransportError> {
        let http = reqwest::Client::new();
        let api_base = settings.api_base();

        let response = http
            .get(format!("{api_base}/users/me"))
            .bearer_auth(&settings.bot_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let identity: Identity = response.json().await?;
        tracing::info!(user_id = %identity.user_id, username = %identity.username, "logged in");

        Ok(Self {
            http,
            api_base,
            token: settings.bot_token.clone(),
            me: identity,
            response_sink: Mutex::new(None),
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), TransportError> {
        let response = self
            .http
            .post(format!("{}{path}", self.api_base))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for RestClient {
    fn user_id(&self) -> &str {
        &self.me.user_id
    }

    fn username(&self) -> &str {
        &self.me.username
    }

    async fn create_post(
        &self,
        channel_id: &str,
        message: &str,
        root_id: Option<&str>,
    ) -> Result<(), TransportError> {
        self.post_json(
            "/posts",
            json!({
                "channel_id": channel_id,
                "message": message,
                "root_id": root_id.unwrap_or(""),
            }),
        )
        .await
    }

    async fn react_to(&self, post_id: &str, emoji_name: &str) -> Result<(), TransportError> {
        self.post_json(
            "/reactions",
            json!({
                "user_id": self.me.user_id,
                "post_id": post_id,
                "emoji_name": emoji_name,
            }),
        )
        .await
    }

    fn register_response_sink(&self, sink: mpsc::UnboundedSender<(String, WebResponse)>) {
        *self.response_sink.lock().expect("response sink lock") = Some(sink);
    }

    fn send_web_response(
        &self,
        request_id: &str,
        response: WebResponse,
    ) -> Result<(), TransportError> {
        let guard = self.response_sink.lock().expect("response sink lock");
        let sink = guard.as_ref().ok_or(TransportError::NoResponseSink)?;
        sink.send((request_id.to_string(), response))
            .map_err(|_| TransportError::NoResponseSink)
    }
}

/// Long-lived websocket reader feeding decoded events into the dispatcher.
///
/// Reconnects on drop with a linearly growing, bounded delay; gives up with
/// [`TransportError::ReconnectFailed`] after `max_attempts` consecutive
/// failures. A successful connection resets the counter.
pub struct WebSocketListener {
    ws_url: Url,
    token: String,
    max_attempts: u32,
    backoff_base: Duration,
}

impl WebSocketListener {
    pub fn new(settings: &Settings) -> Result<Self, TransportError> {
        Ok(Self {
            ws_url: Url::parse(&settings.websocket_url())?,
            token: settings.bot_token.clone(),
            max_attempts: 10,
            backoff_base: Duration::from_secs(3),
        })
    }

    /// Override the reconnect policy.
    pub fn with_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_base = backoff_base;
        self
    }

    /// Read frames until the event channel closes or reconnection is
    /// exhausted. Frames that don't decode to an event are dropped
    /// silently.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<RemoteEvent>,
    ) -> Result<(), TransportError> {
        let mut attempts: u32 = 0;
        loop {
            match connect_async(self.ws_url.as_str()).await {
                Ok((mut stream, _)) => {
                    tracing::info!(url = %self.ws_url, "websocket connected");

                    let challenge = json!({
                        "seq": 1,
                        "action": "authentication_challenge",
                        "data": {"token": self.token},
                    });
                    // A send failure here is a socket failure like any
                    // other and goes through the reconnect path below.
                    match stream.send(WsMessage::text(challenge.to_string())).await {
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to send authentication challenge");
                        }
                        Ok(()) => {
                            attempts = 0;
                            while let Some(frame) = stream.next().await {
                                match frame {
                                    Ok(WsMessage::Text(raw)) => {
                                        if let Some(event) = RemoteEvent::parse(raw.as_str())
                                            && event_tx.send(event).is_err()
                                        {
                                            tracing::info!(
                                                "event channel closed, stopping listener"
                                            );
                                            return Ok(());
                                        }
                                    }
                                    Ok(WsMessage::Close(_)) => break,
                                    Ok(_) => {}
                                    Err(e) => {
                                        tracing::warn!(error = %e, "websocket read failed");
                                        break;
                                    }
                                }
                            }
                            tracing::warn!("websocket disconnected");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempts, "websocket connect failed");
                }
            }

            attempts += 1;
            if attempts >= self.max_attempts {
                return Err(TransportError::ReconnectFailed { attempts });
            }
            // First retry is immediate; repeated failures back off linearly
            // up to a cap.
            let delay = self.backoff_base * (attempts - 1).min(6);
            if !delay.is_zero() {
                tracing::info!(delay_secs = delay.as_secs(), attempts, "reconnecting");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
