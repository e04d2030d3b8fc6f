//! One-time and recurring job scheduling.
//!
//! The scheduler only owns job records; it runs nothing on its own. A pump
//! task on the worker pool calls [`Scheduler::run_pending`] once per trigger
//! period, and due job bodies execute inside that pump task, one at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identifier for a scheduled job.
pub type JobId = Uuid;

/// Async closure owned by a job.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// When a job fires.
#[derive(Debug, Clone, Copy)]
pub enum Schedule {
    /// Fire at most once, at or after the recorded `next_run`. Never
    /// re-armed: the job is removed from the set before its body runs.
    Once,
    /// Re-arm one interval after each run completes.
    Every(Duration),
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its `next_run` time.
    Pending,
    /// Body currently executing (recurring jobs only; one-time jobs are
    /// removed from the set before execution).
    Running,
}

/// What a job executes.
#[derive(Clone)]
pub enum JobBody {
    /// An async closure, run inside the scheduler pump task.
    Task(JobFn),
    /// An external command, run in its own OS process. Isolates the pump
    /// from a crashing job body, but the pump still blocks until the
    /// process exits and its output is collected.
    Subprocess { program: String, args: Vec<String> },
}

impl std::fmt::Debug for JobBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobBody::Task(_) => f.write_str("Task"),
            JobBody::Subprocess { program, args } => f
                .debug_struct("Subprocess")
                .field("program", program)
                .field("args", args)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    id: JobId,
    schedule: Schedule,
    next_run: DateTime<Utc>,
    state: JobState,
    body: JobBody,
}

/// Holds job records and advances them when polled.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
}

/// Pending registration returned by [`Scheduler::once`] and
/// [`Scheduler::every`]; call [`JobBuilder::run`] or [`JobBuilder::command`]
/// to insert the job.
pub struct JobBuilder<'a> {
    scheduler: &'a Scheduler,
    schedule: Schedule,
    next_run: DateTime<Utc>,
}

impl JobBuilder<'_> {
    /// Register an async closure as the job body.
    pub async fn run<F, Fut>(self, f: F) -> JobId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let body = JobBody::Task(Arc::new(move || Box::pin(f()) as BoxFuture<'static, ()>));
        self.insert(body).await
    }

    /// Register an external command as the job body. The command runs in a
    /// separate process when the job fires.
    pub async fn command(self, program: impl Into<String>, args: Vec<String>) -> JobId {
        self.insert(JobBody::Subprocess {
            program: program.into(),
            args,
        })
        .await
    }

    async fn insert(self, body: JobBody) -> JobId {
        let id = Uuid::new_v4();
        let job = Job {
            id,
            schedule: self.schedule,
            next_run: self.next_run,
            state: JobState::Pending,
            body,
        };
        self.scheduler.jobs.lock().await.push(job);
        tracing::debug!(job_id = %id, next_run = %self.next_run, "job scheduled");
        id
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a job that fires at most once, at or after `at`.
    pub fn once(&self, at: DateTime<Utc>) -> JobBuilder<'_> {
        JobBuilder {
            scheduler: self,
            schedule: Schedule::Once,
            next_run: at,
        }
    }

    /// Schedule a job that fires every `interval`, starting one interval
    /// from now.
    pub fn every(&self, interval: Duration) -> JobBuilder<'_> {
        let interval_chrono =
            chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        JobBuilder {
            scheduler: self,
            schedule: Schedule::Every(interval),
            next_run: Utc::now() + interval_chrono,
        }
    }

    /// Run every due job, sequentially, in the calling task.
    ///
    /// One-time jobs are removed from the set before their body executes,
    /// so repeated polling can never fire them twice. Recurring jobs are
    /// marked running while their body executes and re-armed one interval
    /// after it completes; a body slower than its interval runs at a
    /// steady cadence instead of accumulating overdue deadlines and
    /// burst-firing on later polls.
    pub async fn run_pending(&self) {
        let now = Utc::now();
        let due: Vec<(JobId, Schedule, JobBody)> = {
            let mut jobs = self.jobs.lock().await;
            let mut due = Vec::new();
            jobs.retain_mut(|job| {
                if job.state == JobState::Running || job.next_run > now {
                    return true;
                }
                due.push((job.id, job.schedule, job.body.clone()));
                match job.schedule {
                    Schedule::Once => false,
                    Schedule::Every(_) => {
                        job.state = JobState::Running;
                        true
                    }
                }
            });
            due
        };

        for (id, schedule, body) in due {
            tracing::debug!(job_id = %id, "running scheduled job");
            match body {
                JobBody::Task(f) => f().await,
                JobBody::Subprocess { program, args } => {
                    // Blocks this pump task until the child exits; the
                    // subprocess only isolates the job body itself.
                    match tokio::process::Command::new(&program)
                        .args(&args)
                        .output()
                        .await
                    {
                        Ok(output) => {
                            tracing::debug!(
                                job_id = %id,
                                status = %output.status,
                                stdout_bytes = output.stdout.len(),
                                "subprocess job finished"
                            );
                        }
                        Err(e) => {
                            tracing::error!(job_id = %id, error = %e, "subprocess job failed to spawn");
                        }
                    }
                }
            }
            if let Schedule::Every(interval) = schedule {
                let mut jobs = self.jobs.lock().await;
                if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                    job.state = JobState::Pending;
                    job.next_run = Utc::now()
                        + chrono::Duration::from_std(interval)
                            .unwrap_or(chrono::Duration::zero());
                }
            }
        }
    }

    /// Remove a single job. Returns `true` if it was still scheduled.
    pub async fn cancel(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        jobs.len() < before
    }

    /// Remove every job immediately. Bodies already dispatched keep running
    /// to completion; cancellation is not preemptive.
    pub async fn cancel_all(&self) {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.len();
        jobs.clear();
        tracing::info!(removed, "cancelled all scheduled jobs");
    }

    /// Number of job records currently held.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// State of a job, if it is still scheduled.
    pub async fn job_state(&self, id: JobId) -> Option<JobState> {
        self.jobs.lock().await.iter().find(|j| j.id == id).map(|j| j.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_job(counter: &Arc<AtomicUsize>) -> impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn one_time_job_does_not_fire_early() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .once(Utc::now() + chrono::Duration::milliseconds(200))
            .run(counter_job(&counter))
            .await;

        scheduler.run_pending().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.job_count().await, 1);
    }

    #[tokio::test]
    async fn one_time_job_fires_exactly_once_under_repeated_polling() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .once(Utc::now() - chrono::Duration::milliseconds(1))
            .run(counter_job(&counter))
            .await;

        for _ in 0..5 {
            scheduler.run_pending().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test]
    async fn recurring_job_rearms_after_each_run() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .every(Duration::from_millis(200))
            .run(counter_job(&counter))
            .await;

        // Poll continuously for 3.5 intervals: the job should fire three times.
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(700) {
            scheduler.run_pending().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.job_count().await, 1);
    }

    #[tokio::test]
    async fn recurring_job_slower_than_its_interval_does_not_burst_fire() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = scheduler
            .every(Duration::from_millis(100))
            .run({
                let counter = Arc::clone(&counter);
                move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(450)).await;
                    }
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Back-to-back polls: the first runs the slow body; the intervals
        // the body outlasted must not translate into extra immediate runs.
        for _ in 0..5 {
            scheduler.run_pending().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Re-armed one interval after the body finished, so it fires again
        // once that interval has passed.
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.run_pending().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.job_state(id).await, Some(JobState::Pending));
    }

    #[tokio::test]
    async fn cancel_all_stops_further_executions() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .every(Duration::from_millis(20))
            .run(counter_job(&counter))
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.run_pending().await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1);

        scheduler.cancel_all().await;
        assert_eq!(scheduler.job_count().await, 0);

        for _ in 0..10 {
            scheduler.run_pending().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn cancel_single_job() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let keep = scheduler
            .every(Duration::from_secs(3600))
            .run(counter_job(&counter))
            .await;
        let drop_ = scheduler
            .every(Duration::from_secs(3600))
            .run(counter_job(&counter))
            .await;

        assert!(scheduler.cancel(drop_).await);
        assert!(!scheduler.cancel(drop_).await);
        assert_eq!(scheduler.job_count().await, 1);
        assert_eq!(scheduler.job_state(keep).await, Some(JobState::Pending));
    }

    #[tokio::test]
    async fn subprocess_job_runs_external_command() {
        let scheduler = Scheduler::new();
        scheduler
            .once(Utc::now() - chrono::Duration::milliseconds(1))
            .command("true", vec![])
            .await;

        scheduler.run_pending().await;
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test]
    async fn subprocess_spawn_failure_does_not_poison_scheduler() {
        let scheduler = Scheduler::new();
        scheduler
            .once(Utc::now() - chrono::Duration::milliseconds(1))
            .command("definitely-not-a-real-binary-xyz", vec![])
            .await;
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .once(Utc::now() - chrono::Duration::milliseconds(1))
            .run(counter_job(&counter))
            .await;

        scheduler.run_pending().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
