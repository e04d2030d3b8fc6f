//! End-to-end webhook path: HTTP POST in, listener response out, through
//! the assembled bot rather than the server in isolation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mattbot::error::TransportError;
use mattbot::models::WebhookEvent;
use mattbot::plugins::WebhookListener;
use mattbot::{Bot, Plugin, RemoteClient, Settings, WebResponse};
use serde_json::{Value, json};
use tokio::sync::mpsc;

struct NullClient {
    sink: Mutex<Option<mpsc::UnboundedSender<(String, WebResponse)>>>,
}

#[async_trait]
impl RemoteClient for NullClient {
    fn user_id(&self) -> &str {
        "u_bot"
    }

    fn username(&self) -> &str {
        "bot"
    }

    async fn create_post(
        &self,
        _channel_id: &str,
        _message: &str,
        _root_id: Option<&str>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn react_to(&self, _post_id: &str, _emoji: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn register_response_sink(&self, sink: mpsc::UnboundedSender<(String, WebResponse)>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn send_web_response(
        &self,
        request_id: &str,
        response: WebResponse,
    ) -> Result<(), TransportError> {
        let guard = self.sink.lock().unwrap();
        let sink = guard.as_ref().ok_or(TransportError::NoResponseSink)?;
        sink.send((request_id.to_string(), response))
            .map_err(|_| TransportError::NoResponseSink)
    }
}

struct GreeterPlugin;

impl Plugin for GreeterPlugin {
    fn name(&self) -> &str {
        "greeter"
    }

    fn webhook_listeners(&self) -> Vec<WebhookListener> {
        vec![
            WebhookListener::new("^greet$", |ctx, event: Arc<WebhookEvent>| async move {
                let name = event
                    .body
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("stranger");
                ctx.client
                    .respond_to_web(
                        &event,
                        WebResponse::Json(json!({"text": format!("hello, {name}")})),
                    )
                    .await?;
                Ok(())
            })
            .unwrap(),
        ]
    }
}

async fn start_bot() -> (Arc<Bot>, tokio::task::JoinHandle<()>, String) {
    let settings = Settings {
        // Nothing listens on the chat side; the socket listener just
        // retries in the background while the webhook path is exercised.
        server_url: "http://127.0.0.1".to_string(),
        server_port: 1,
        webhook_host_enabled: true,
        webhook_port: 0,
        webhook_response_timeout: Duration::from_secs(5),
        ..Settings::default()
    };
    let client = Arc::new(NullClient {
        sink: Mutex::new(None),
    });
    let bot = Arc::new(Bot::new(settings, client, vec![Arc::new(GreeterPlugin)]));

    let runner = tokio::spawn({
        let bot = Arc::clone(&bot);
        async move {
            bot.run().await.expect("bot run");
        }
    });

    let mut addr = None;
    for _ in 0..100 {
        if let Some(bound) = bot.webhook_addr() {
            addr = Some(bound);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let addr = addr.expect("webhook server should bind");
    (bot, runner, format!("http://{addr}/hooks"))
}

#[tokio::test]
async fn webhook_post_gets_the_listener_response() {
    let (bot, runner, base) = start_bot().await;

    let response = reqwest::Client::new()
        .post(format!("{base}/greet"))
        .json(&json!({"trigger_id": "t-int", "name": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"text": "hello, alice"}));

    // Unmatched ids complete immediately with an empty 200.
    let response = reqwest::Client::new()
        .post(format!("{base}/nobody"))
        .json(&json!({"text": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "");

    bot.stop().await;
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run loop should end after stop")
        .expect("run task should not panic");
}
