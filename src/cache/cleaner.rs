//! Cache Cleaner
//!
//! Deferred retry of failed cache invalidations. A node whose delete fails
//! hands the delete over with [`CacheCleaner::add_clean_task`]; the cleaner
//! re-runs it on a fixed backoff ladder driven by a shared timing wheel, and
//! reports it once the ladder is exhausted.
//!
//! ```text
//! add_clean_task ──► TimingWheel ──(due)──► mpsc ──► dispatcher ──► worker (permit)
//!                        ▲                                            │
//!                        └──────────── next backoff stage ◄── failed ─┘
//! ```
//!
//! One cleaner is built at startup and shared by every node through an `Arc`.
//! [`CacheCleaner::shutdown`] gives every pending retry one last run before
//! stopping: tasks already queued for a worker, tasks still in the wheel, and
//! tasks that fire while the wheel is being stopped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::collection::TimingWheel;
use crate::config::CleanerConfig;
use crate::error::{Error, Result};
use crate::report::Reporter;

use super::format_keys;

/// Delay before each retry, indexed by stage
pub const BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(60 * 60),
];

/// Re-runnable invalidation
pub type RetryAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Pending retry
#[derive(Clone)]
pub struct DelayTask {
    stage: usize,
    task: RetryAction,
    keys: Vec<String>,
}

impl DelayTask {
    /// Index into [`BACKOFF`] of the delay this task is waiting on
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    async fn run(&self) -> Result<()> {
        (self.task)().await
    }
}

impl std::fmt::Debug for DelayTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayTask")
            .field("stage", &self.stage)
            .field("keys", &self.keys)
            .finish()
    }
}

/// Retry scheduler shared by all cache nodes
pub struct CacheCleaner {
    wheel: TimingWheel<u64, DelayTask>,
    next_task: AtomicU64,
    reporter: Arc<dyn Reporter>,
    stopping: CancellationToken,
    /// Resolves to the number of queued tasks flushed at shutdown
    dispatcher: Mutex<Option<JoinHandle<usize>>>,
}

impl std::fmt::Debug for CacheCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCleaner")
            .field("wheel", &self.wheel)
            .field("next_task", &self.next_task)
            .finish()
    }
}

impl CacheCleaner {
    /// Start the wheel and the retry dispatcher on the current runtime
    pub fn new(config: CleanerConfig, reporter: Arc<dyn Reporter>) -> Result<Arc<Self>> {
        if config.workers == 0 {
            return Err(Error::Config("cache cleaner needs at least one worker".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel::<(u64, DelayTask)>();
        let fallback = Arc::clone(&reporter);
        let on_fire = move |id: u64, task: DelayTask| {
            let tx = tx.clone();
            let reporter = Arc::clone(&fallback);
            async move {
                // Dispatcher already flushed: run it here instead of dropping it
                if let Err(mpsc::error::SendError((id, task))) = tx.send((id, task)) {
                    debug!(task = id, "Cleaner dispatcher closed, running task inline");
                    last_attempt(reporter.as_ref(), id, &task).await;
                }
            }
        };
        let wheel = TimingWheel::new(config.tick_interval, config.slots, on_fire)?;

        let stopping = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            rx,
            wheel.clone(),
            Arc::clone(&reporter),
            Arc::new(Semaphore::new(config.workers)),
            stopping.clone(),
        ));

        info!(
            tick = ?config.tick_interval,
            slots = config.slots,
            workers = config.workers,
            "Cache cleaner started"
        );

        Ok(Arc::new(Self {
            wheel,
            next_task: AtomicU64::new(0),
            reporter,
            stopping,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    /// Schedule `task` to be retried, starting one backoff step from now
    ///
    /// `keys` only label the task in logs and reports.
    pub async fn add_clean_task<F, Fut>(&self, task: F, keys: Vec<String>) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        debug!(task = id, keys = %format_keys(&keys), "Scheduling cache clean task");

        let task = DelayTask {
            stage: 0,
            task: Arc::new(move || task().boxed()),
            keys,
        };
        self.wheel.set_timer(id, task, BACKOFF[0]).await
    }

    /// Sink for permanently failed tasks
    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Run every pending task one last time, then stop
    ///
    /// The dispatcher first flushes what is already queued and waits for its
    /// workers, then the wheel is drained. Returns how many tasks were pending.
    /// Tasks that still fail are reported.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<usize> {
        self.stopping.cancel();
        let dispatcher = self.dispatcher.lock().take();
        let flushed = match dispatcher {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("cache cleaner dispatcher failed: {}", e)))?,
            None => 0,
        };

        let reporter = Arc::clone(&self.reporter);
        let drained = self
            .wheel
            .drain(move |id, task: DelayTask| {
                let reporter = Arc::clone(&reporter);
                async move {
                    last_attempt(reporter.as_ref(), id, &task).await;
                }
            })
            .await?;

        self.wheel.stop();
        info!(flushed, drained, "Cache cleaner stopped");
        Ok(flushed + drained)
    }
}

/// Hand fired tasks to workers, at most one per permit
///
/// Once `stopping` fires, the queue is closed and every task left in it gets
/// one final run. Returns how many tasks were flushed that way.
async fn dispatch(
    mut fired: mpsc::UnboundedReceiver<(u64, DelayTask)>,
    wheel: TimingWheel<u64, DelayTask>,
    reporter: Arc<dyn Reporter>,
    workers: Arc<Semaphore>,
    stopping: CancellationToken,
) -> usize {
    let mut running = JoinSet::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = stopping.cancelled() => break,
            next = fired.recv() => next,
        };
        let Some((id, task)) = next else {
            break;
        };
        while running.try_join_next().is_some() {}

        let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
            last_attempt(reporter.as_ref(), id, &task).await;
            break;
        };
        let wheel = wheel.clone();
        let reporter = Arc::clone(&reporter);
        running.spawn(async move {
            let _permit = permit;
            retry(&wheel, reporter.as_ref(), id, task).await;
        });
    }

    fired.close();
    let mut flushed = 0;
    while let Some((id, task)) = fired.recv().await {
        flushed += 1;
        let permit = Arc::clone(&workers).acquire_owned().await.ok();
        let reporter = Arc::clone(&reporter);
        running.spawn(async move {
            let _permit = permit;
            last_attempt(reporter.as_ref(), id, &task).await;
        });
    }
    while running.join_next().await.is_some() {}

    debug!(flushed, "Cache cleaner dispatcher exited");
    flushed
}

/// Final run of a task at shutdown; a failure is reported, not retried
async fn last_attempt(reporter: &dyn Reporter, id: u64, task: &DelayTask) {
    if let Err(e) = task.run().await {
        reporter.report(&format!(
            "cache clean task {} failed at shutdown, keys: {}, error: {}",
            id,
            format_keys(&task.keys),
            e
        ));
    }
}

async fn retry(
    wheel: &TimingWheel<u64, DelayTask>,
    reporter: &dyn Reporter,
    id: u64,
    mut task: DelayTask,
) {
    let error = match task.run().await {
        Ok(()) => {
            debug!(task = id, stage = task.stage, "Cache clean task succeeded");
            return;
        }
        Err(e) => e,
    };

    let next = task.stage + 1;
    let Some(&delay) = BACKOFF.get(next) else {
        reporter.report(&format!(
            "cache clean task {} failed after {} retries, keys: {}, error: {}",
            id,
            BACKOFF.len(),
            format_keys(&task.keys),
            error
        ));
        return;
    };

    warn!(task = id, stage = next, ?delay, error = %error, "Cache clean task failed, retrying");
    let keys = format_keys(&task.keys);
    task.stage = next;
    if let Err(e) = wheel.set_timer(id, task, delay).await {
        reporter.report(&format!(
            "cache clean task {} could not be rescheduled, keys: {}, error: {}",
            id, keys, e
        ));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<String>>);

    impl Reporter for Collecting {
        fn report(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    /// Action failing its first `failures` runs, recording when each run happened
    fn flaky(
        failures: usize,
        attempts: Arc<Mutex<Vec<Instant>>>,
    ) -> impl Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
        let runs = Arc::new(AtomicUsize::new(0));
        move || {
            let runs = Arc::clone(&runs);
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.lock().push(Instant::now());
                if runs.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(Error::Backend("connection refused".to_string()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    fn offsets(start: Instant, attempts: &Mutex<Vec<Instant>>) -> Vec<Duration> {
        attempts.lock().iter().map(|t| *t - start).collect()
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let config = CleanerConfig {
            workers: 0,
            ..CleanerConfig::default()
        };
        assert_matches!(
            CacheCleaner::new(config, Arc::new(Collecting::default())),
            Err(Error::Config(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_second_stage() {
        let reporter = Arc::new(Collecting::default());
        let cleaner = CacheCleaner::new(CleanerConfig::default(), reporter.clone()).unwrap();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let start = Instant::now();
        cleaner
            .add_clean_task(flaky(1, Arc::clone(&attempts)), vec!["user:1".to_string()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let offsets = offsets(start, &attempts);
        assert_eq!(offsets.len(), 2, "{:?}", offsets);
        assert!(offsets[0] >= Duration::from_secs(1) && offsets[0] <= Duration::from_secs(2));
        let gap = offsets[1] - offsets[0];
        assert!(gap >= Duration::from_secs(5) && gap <= Duration::from_secs(6), "{:?}", gap);
        assert!(reporter.0.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_walks_ladder_then_reports() {
        let reporter = Arc::new(Collecting::default());
        let cleaner = CacheCleaner::new(CleanerConfig::default(), reporter.clone()).unwrap();
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let start = Instant::now();
        cleaner
            .add_clean_task(
                flaky(usize::MAX, Arc::clone(&attempts)),
                vec!["a".to_string(), "b".to_string()],
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5000)).await;

        let offsets = offsets(start, &attempts);
        assert_eq!(offsets.len(), BACKOFF.len(), "{:?}", offsets);

        let mut previous = Duration::ZERO;
        for (offset, delay) in offsets.iter().zip(BACKOFF) {
            let gap = *offset - previous;
            assert!(gap >= delay && gap <= delay + Duration::from_secs(1), "{:?} vs {:?}", gap, delay);
            previous = *offset;
        }

        let reports = reporter.0.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("a,b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_pending_tasks() {
        let reporter = Arc::new(Collecting::default());
        let cleaner = CacheCleaner::new(CleanerConfig::default(), reporter.clone()).unwrap();
        let ok_attempts = Arc::new(Mutex::new(Vec::new()));
        let bad_attempts = Arc::new(Mutex::new(Vec::new()));

        cleaner
            .add_clean_task(flaky(0, Arc::clone(&ok_attempts)), vec!["ok".to_string()])
            .await
            .unwrap();
        cleaner
            .add_clean_task(
                flaky(usize::MAX, Arc::clone(&bad_attempts)),
                vec!["bad".to_string()],
            )
            .await
            .unwrap();

        let drained = cleaner.shutdown().await.unwrap();
        assert_eq!(drained, 2);
        assert_eq!(ok_attempts.lock().len(), 1);
        assert_eq!(bad_attempts.lock().len(), 1);

        let reports = reporter.0.lock().clone();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("bad"));

        // Nothing fires after shutdown
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ok_attempts.lock().len(), 1);
        assert_eq!(bad_attempts.lock().len(), 1);
        let late = cleaner
            .add_clean_task(flaky(0, Arc::new(Mutex::new(Vec::new()))), Vec::new())
            .await;
        assert_matches!(late, Err(Error::WheelStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_runs_tasks_queued_behind_busy_worker() {
        let config = CleanerConfig {
            workers: 1,
            ..CleanerConfig::default()
        };
        let reporter = Arc::new(Collecting::default());
        let cleaner = CacheCleaner::new(config, reporter.clone()).unwrap();
        let slow_runs = Arc::new(AtomicUsize::new(0));
        let waiting_attempts = Arc::new(Mutex::new(Vec::new()));
        let queued_attempts = Arc::new(Mutex::new(Vec::new()));

        let runs = Arc::clone(&slow_runs);
        cleaner
            .add_clean_task(
                move || {
                    let runs = Arc::clone(&runs);
                    async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                vec!["slow".to_string()],
            )
            .await
            .unwrap();
        cleaner
            .add_clean_task(
                flaky(usize::MAX, Arc::clone(&waiting_attempts)),
                vec!["waiting".to_string()],
            )
            .await
            .unwrap();
        cleaner
            .add_clean_task(
                flaky(usize::MAX, Arc::clone(&queued_attempts)),
                vec!["queued".to_string()],
            )
            .await
            .unwrap();

        // All three fired; the slow one holds the only worker
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(waiting_attempts.lock().is_empty());
        assert!(queued_attempts.lock().is_empty());

        let pending = cleaner.shutdown().await.unwrap();
        assert_eq!(pending, 2);
        assert_eq!(slow_runs.load(Ordering::SeqCst), 1);
        assert!(!waiting_attempts.lock().is_empty());
        assert!(!queued_attempts.lock().is_empty());

        let reports = reporter.0.lock().clone();
        assert_eq!(reports.len(), 2, "{:?}", reports);
        assert!(reports.iter().any(|r| r.contains("waiting")));
        assert!(reports.iter().any(|r| r.contains("queued")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_shutdown_is_rejected() {
        let cleaner =
            CacheCleaner::new(CleanerConfig::default(), Arc::new(Collecting::default())).unwrap();
        assert_eq!(cleaner.shutdown().await.unwrap(), 0);
        assert_matches!(cleaner.shutdown().await, Err(Error::WheelStopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_bound_concurrency() {
        let config = CleanerConfig {
            workers: 2,
            ..CleanerConfig::default()
        };
        let cleaner = CacheCleaner::new(config, Arc::new(Collecting::default())).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            cleaner
                .add_clean_task(
                    move || {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        let done = Arc::clone(&done);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                    vec![format!("key{}", i)],
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
