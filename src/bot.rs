//! Top-level wiring: transport, worker pool, scheduler, webhook server and
//! dispatcher assembled into one runnable bot.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use crate::config::Settings;
use crate::dispatch::EventDispatcher;
use crate::error::Error;
use crate::plugins::{Context, Plugin, PluginManager};
use crate::pool::WorkerPool;
use crate::scheduler::Scheduler;
use crate::transport::{RemoteClient, WebSocketListener};
use crate::webhook::WebhookServer;

/// The assembled bot. Construct with [`Bot::new`], drive with
/// [`Bot::run`], and shut down from another task with [`Bot::stop`].
pub struct Bot {
    settings: Settings,
    client: Arc<dyn RemoteClient>,
    manager: PluginManager,
    pool: WorkerPool,
    scheduler: Arc<Scheduler>,
    bound_webhook_addr: OnceLock<SocketAddr>,
}

impl Bot {
    pub fn new(
        settings: Settings,
        client: Arc<dyn RemoteClient>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Self {
        let pool = WorkerPool::new(settings.workers);
        Self {
            settings,
            client,
            manager: PluginManager::new(plugins),
            pool,
            scheduler: Arc::new(Scheduler::new()),
            bound_webhook_addr: OnceLock::new(),
        }
    }

    /// The shared scheduler; plugins register jobs here before or after
    /// the bot starts.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Address the webhook server actually bound to, once running.
    /// Relevant when the configured port is 0.
    pub fn webhook_addr(&self) -> Option<SocketAddr> {
        self.bound_webhook_addr.get().copied()
    }

    /// Start every component and run the dispatch loop until [`stop`]
    /// is called or both ingress channels close.
    ///
    /// [`stop`]: Self::stop
    pub async fn run(&self) -> Result<(), Error> {
        let registry = Arc::new(self.manager.build_registry());
        let ctx = Context::new(Arc::clone(&self.client), self.pool.clone());
        let dispatcher = EventDispatcher::new(registry, ctx, &self.settings)?;

        let (event_tx, events_rx) = mpsc::unbounded_channel();
        let (webhook_tx, webhooks_rx) = mpsc::unbounded_channel();

        self.pool.start();
        self.pool
            .start_scheduler_pump(Arc::clone(&self.scheduler), self.settings.scheduler_period);

        if self.settings.webhook_host_enabled {
            let (response_tx, response_rx) = mpsc::unbounded_channel();
            self.client.register_response_sink(response_tx);
            let server = WebhookServer::bind(
                self.settings.webhook_addr()?,
                self.settings.webhook_response_timeout,
                webhook_tx,
                response_rx,
            )
            .await?;
            let _ = self.bound_webhook_addr.set(server.local_addr());
            self.pool.start_webhook_pump(server);
        } else {
            // Close the webhook ingress so the dispatcher only waits on
            // the socket side.
            drop(webhook_tx);
        }

        let listener = WebSocketListener::new(&self.settings)?;
        let ws_handle = tokio::spawn(async move {
            if let Err(e) = listener.run(event_tx).await {
                tracing::error!(error = %e, "event listener terminated");
            }
        });

        self.manager.start_all();
        tracing::info!("bot running");

        tokio::select! {
            _ = dispatcher.run(events_rx, webhooks_rx) => {}
            _ = self.pool.on_stopped() => {}
        }
        ws_handle.abort();
        tracing::info!("bot run loop ended");
        Ok(())
    }

    /// Orderly shutdown: cancel scheduled jobs, drain and stop the worker
    /// pool (which also stops the pumps riding on it), then notify plugins.
    pub async fn stop(&self) {
        tracing::info!("stopping bot");
        self.scheduler.cancel_all().await;
        self.pool.stop().await;
        self.manager.stop_all();
    }
}
