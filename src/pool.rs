//! Shared worker pool.
//!
//! A fixed set of long-lived worker tasks drains one queue. Message
//! listeners marked for pooled execution, scheduled jobs, and the webhook
//! server all ride on this pool rather than spawning bespoke tasks.
//!
//! Shutdown enqueues exactly one poison task per worker instead of an
//! external cancel signal, so every worker receives exactly one stop marker
//! even though the queue is unordered across workers.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::PoolError;
use crate::scheduler::Scheduler;
use crate::webhook::WebhookServer;

enum Task {
    Run(BoxFuture<'static, ()>),
    Poison,
}

struct Inner {
    workers: usize,
    busy: AtomicUsize,
    alive_tx: watch::Sender<bool>,
    alive_rx: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed-size pool of worker tasks draining a shared FIFO queue.
///
/// Cheap to clone; all clones share the same queue and workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Create a pool that will run `workers` concurrent tasks once started.
    /// Work may be queued before [`start`](Self::start); it runs when the
    /// workers come up.
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                workers,
                busy: AtomicUsize::new(0),
                alive_tx,
                alive_rx,
                tx,
                rx: Mutex::new(rx),
                handles: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the worker tasks.
    pub fn start(&self) {
        let mut handles = self.inner.handles.lock().expect("pool handle lock");
        for worker_id in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = inner.rx.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(Task::Run(fut)) => {
                            inner.busy.fetch_add(1, Ordering::SeqCst);
                            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                                tracing::error!(worker_id, "panic in pooled task");
                            }
                            inner.busy.fetch_sub(1, Ordering::SeqCst);
                        }
                        Some(Task::Poison) | None => break,
                    }
                }
                tracing::debug!(worker_id, "worker exited");
            }));
        }
        tracing::info!(workers = self.inner.workers, "worker pool started");
    }

    /// Queue work for the next free worker. Strict FIFO per worker; no
    /// ordering guarantee across workers.
    pub fn add_task<F>(&self, fut: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_alive() {
            return Err(PoolError::Stopped);
        }
        self.inner
            .tx
            .send(Task::Run(Box::pin(fut)))
            .map_err(|_| PoolError::Stopped)
    }

    /// Number of workers currently executing a task body (not backlog).
    pub fn busy_workers(&self) -> usize {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Whether the pool still accepts work.
    pub fn is_alive(&self) -> bool {
        *self.inner.alive_rx.borrow()
    }

    /// Resolves once [`stop`](Self::stop) has been requested. Used by the
    /// long-lived pump tasks to end their loops promptly.
    pub fn on_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.alive_rx.clone();
        async move {
            // Closed sender also means stopped.
            let _ = rx.wait_for(|alive| !alive).await;
        }
    }

    /// Graceful shutdown: stop accepting work, then wait for every worker
    /// to drain its queue share and exit.
    pub async fn stop(&self) {
        let _ = self.inner.alive_tx.send(false);
        for _ in 0..self.inner.workers {
            let _ = self.inner.tx.send(Task::Poison);
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.handles.lock().expect("pool handle lock");
            guard.drain(..).collect()
        };
        tracing::info!("stopping worker pool, waiting for workers");
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("worker pool stopped");
    }

    /// Occupy one worker with the scheduler pump: sleep one trigger period,
    /// ask the scheduler to run due jobs, repeat until the pool stops.
    pub fn start_scheduler_pump(&self, scheduler: Arc<Scheduler>, trigger_period: Duration) {
        let pool = self.clone();
        let result = self.add_task(async move {
            tracing::info!(period_ms = trigger_period.as_millis() as u64, "scheduler pump started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(trigger_period) => {
                        scheduler.run_pending().await;
                    }
                    _ = pool.on_stopped() => break,
                }
            }
            tracing::info!("scheduler pump stopped");
        });
        if result.is_err() {
            tracing::warn!("scheduler pump not started: pool already stopped");
        }
    }

    /// Occupy one worker with the webhook server: serve until the pool
    /// stops, then shut the server down in order.
    pub fn start_webhook_pump(&self, server: WebhookServer) {
        let shutdown = self.on_stopped();
        let result = self.add_task(async move {
            tracing::info!("webhook server pump started");
            if let Err(e) = server.serve(shutdown).await {
                tracing::error!(error = %e, "webhook server failed");
            }
            tracing::info!("webhook server pump stopped");
        });
        if result.is_err() {
            tracing::warn!("webhook pump not started: pool already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn busy_workers_reflects_executing_tasks_not_backlog() {
        let pool = WorkerPool::new(10);
        pool.start();
        assert_eq!(pool.busy_workers(), 0);

        for _ in 0..2 {
            pool.add_task(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
            })
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.busy_workers(), 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(pool.busy_workers(), 0);
    }

    #[tokio::test]
    async fn single_worker_runs_tasks_fifo() {
        let pool = WorkerPool::new(1);
        pool.start();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            pool.add_task(async move {
                order.lock().await.push(i);
            })
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stop_drains_queued_tasks_before_exiting() {
        let pool = WorkerPool::new(2);
        pool.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.add_task(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn stopped_pool_rejects_new_tasks() {
        let pool = WorkerPool::new(2);
        pool.start();
        pool.stop().await;

        let result = pool.add_task(async {});
        assert!(matches!(result, Err(PoolError::Stopped)));
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_its_worker() {
        let pool = WorkerPool::new(1);
        pool.start();

        pool.add_task(async {
            panic!("listener blew up");
        })
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let after = Arc::clone(&counter);
        pool.add_task(async move {
            after.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.busy_workers(), 0);
    }

    #[tokio::test]
    async fn scheduler_pump_polls_until_stopped() {
        let pool = WorkerPool::new(2);
        pool.start();

        let scheduler = Arc::new(Scheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            scheduler
                .once(Utc::now() - chrono::Duration::milliseconds(1))
                .run(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        }

        pool.start_scheduler_pump(Arc::clone(&scheduler), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        pool.stop().await;
    }
}
