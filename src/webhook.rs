//! Inbound webhook server.
//!
//! Accepts `POST /hooks/{webhook_id}`, converts each request into a
//! [`WebhookEvent`] on the shared event queue, and holds the HTTP response
//! open until a correlated reply arrives through the response channel (or
//! the bounded wait expires).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use crate::error::WebhookError;
use crate::models::{WebResponse, WebhookEvent};

/// Completion handles for requests still waiting on a listener response.
///
/// The HTTP handler registers an entry; the response pump resolves and
/// removes it. The handler itself removes its entry only when the bounded
/// wait expires, which is what makes late responses harmless: they find no
/// entry and are discarded.
type PendingResponses = Mutex<HashMap<String, oneshot::Sender<WebResponse>>>;

struct ServerState {
    event_tx: mpsc::UnboundedSender<Arc<WebhookEvent>>,
    pending: PendingResponses,
    response_timeout: Duration,
}

/// The webhook ingress server. Constructed with [`bind`](Self::bind), then
/// driven for its whole lifetime by [`serve`](Self::serve) — typically from
/// a pump task on the worker pool.
pub struct WebhookServer {
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    response_rx: mpsc::UnboundedReceiver<(String, WebResponse)>,
}

impl WebhookServer {
    /// Bind the listener. Events flow out through `event_tx`; correlated
    /// replies flow back in through `response_rx`.
    pub async fn bind(
        addr: SocketAddr,
        response_timeout: Duration,
        event_tx: mpsc::UnboundedSender<Arc<WebhookEvent>>,
        response_rx: mpsc::UnboundedReceiver<(String, WebResponse)>,
    ) -> Result<Self, WebhookError> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            WebhookError::StartupFailed {
                reason: format!("failed to bind {addr}: {e}"),
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WebhookError::StartupFailed {
                reason: format!("no local address: {e}"),
            })?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ServerState {
                event_tx,
                pending: Mutex::new(HashMap::new()),
                response_timeout,
            }),
            response_rx,
        })
    }

    /// Address the server actually bound to (relevant when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` resolves, running the response pump alongside
    /// the HTTP server. In-flight requests are unblocked on shutdown: when
    /// the pump drops their completion handles they resolve to empty 200s.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), WebhookError> {
        let app = Router::new()
            .route("/hooks/{webhook_id}", post(process_webhook))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state));

        tracing::info!(addr = %self.local_addr, "webhook server listening");

        let server = axum::serve(self.listener, app).with_graceful_shutdown(shutdown);
        let pump = run_response_pump(self.response_rx, Arc::clone(&self.state));

        tokio::select! {
            result = server => result.map_err(|e| WebhookError::StartupFailed {
                reason: format!("server error: {e}"),
            })?,
            _ = pump => {}
        }
        tracing::info!("webhook server shut down");
        Ok(())
    }
}

/// Blocking receive on the response channel; resolves the matching pending
/// handle for each `(request_id, response)` pair. Responses whose handle is
/// already gone (resolved or timed out) are discarded — the de-duplication
/// guard against double completion.
async fn run_response_pump(
    mut response_rx: mpsc::UnboundedReceiver<(String, WebResponse)>,
    state: Arc<ServerState>,
) {
    while let Some((request_id, response)) = response_rx.recv().await {
        let handle = state
            .pending
            .lock()
            .expect("pending response lock")
            .remove(&request_id);
        match handle {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(%request_id, "discarding response for unknown or completed request");
            }
        }
    }
}

async fn process_webhook(
    State(state): State<Arc<ServerState>>,
    Path(webhook_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => return failed(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };

    let event = WebhookEvent::new(webhook_id, body);
    let request_id = event.request_id.clone();
    tracing::debug!(%request_id, webhook_id = %event.webhook_id, action = event.is_action, "webhook received");

    let (tx, rx) = oneshot::channel();
    state
        .pending
        .lock()
        .expect("pending response lock")
        .insert(request_id.clone(), tx);

    if state.event_tx.send(event).is_err() {
        state
            .pending
            .lock()
            .expect("pending response lock")
            .remove(&request_id);
        return failed(StatusCode::SERVICE_UNAVAILABLE, "event dispatcher unavailable");
    }

    match tokio::time::timeout(state.response_timeout, rx).await {
        Ok(Ok(WebResponse::Json(value))) => Json(value).into_response(),
        Ok(Ok(WebResponse::None)) => StatusCode::OK.into_response(),
        // Pump dropped the handle during shutdown; nothing more will come.
        Ok(Err(_)) => StatusCode::OK.into_response(),
        Err(_) => {
            state
                .pending
                .lock()
                .expect("pending response lock")
                .remove(&request_id);
            tracing::warn!(%request_id, "webhook response timed out");
            failed(
                StatusCode::GATEWAY_TIMEOUT,
                "timed out waiting for a listener response",
            )
        }
    }
}

fn failed(status: StatusCode, reason: &str) -> Response {
    (status, Json(json!({"status": "failed", "reason": reason}))).into_response()
}
