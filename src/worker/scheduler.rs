use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;

/// Interval used when the configured one is zero.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(5000);

/// Delay before the first tick fires.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(5);

/// How long `stop` waits for an in-flight tick before aborting it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle misuse of a scheduler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler has been stopped and cannot be restarted")]
    Stopped,

    #[error("scheduler is not running; start it before waiting on it")]
    NotRunning,
}

/// One unit of periodic work.
///
/// `since` is the watermark: the wall-clock time the previous tick finished,
/// or `None` on the first tick.
pub trait Tick: Send + Sync + 'static {
    fn run(&self, since: Option<SystemTime>) -> impl Future<Output = Result<()>> + Send;
}

enum State {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Fixed-interval tick loop with an Idle -> Running -> Stopped lifecycle.
///
/// Ticks never overlap: each tick is awaited before the next one is
/// scheduled, and ticks missed while a slow tick runs are skipped rather
/// than queued. A failing or panicking tick is logged and the loop carries
/// on. Dropping the scheduler cancels the loop.
pub struct Scheduler {
    name: Arc<str>,
    interval: Duration,
    initial_delay: Duration,
    shutdown_timeout: Duration,
    state: Mutex<State>,
    cancel: CancellationToken,
    finished: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("initial_delay", &self.initial_delay)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Scheduler {
    /// Creates an idle scheduler. A zero interval falls back to
    /// [`DEFAULT_INTERVAL`].
    pub fn new(name: impl Into<Arc<str>>, interval: Duration) -> Self {
        let name = name.into();
        let interval = if interval.is_zero() {
            warn!(
                scheduler = %name,
                fallback = ?DEFAULT_INTERVAL,
                "invalid tick interval, using default",
            );
            DEFAULT_INTERVAL
        } else {
            interval
        };

        Self {
            name,
            interval,
            initial_delay: DEFAULT_INITIAL_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: Mutex::new(State::Idle),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            health: None,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the graceful wind-down budget used by `stop`.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Attaches health metrics for tick counters.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true while the tick loop is alive.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running(_)) && !self.finished.is_cancelled()
    }

    /// Spawns the tick loop on the current tokio runtime.
    ///
    /// May be called once; a second call or a call after `stop` is an error.
    pub fn start<T: Tick>(&self, op: Arc<T>) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        match *state {
            State::Running(_) => return Err(SchedulerError::AlreadyStarted),
            State::Stopped => return Err(SchedulerError::Stopped),
            State::Idle => {}
        }

        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.name),
            op,
            self.interval,
            self.initial_delay,
            self.cancel.clone(),
            self.finished.clone(),
            self.health.clone(),
        ));
        *state = State::Running(handle);

        info!(
            scheduler = %self.name,
            interval = ?self.interval,
            initial_delay = ?self.initial_delay,
            "scheduler started",
        );
        Ok(())
    }

    /// Cancels future ticks and shuts the loop down.
    ///
    /// An in-flight tick gets `shutdown_timeout` to finish before it is
    /// aborted. Safe to call when never started and safe to call twice.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        self.cancel.cancel();

        let mut handle = match previous {
            State::Running(handle) => handle,
            State::Idle => {
                debug!(scheduler = %self.name, "scheduler stopped before start");
                return;
            }
            State::Stopped => return,
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => info!(scheduler = %self.name, "scheduler stopped"),
            Ok(Err(e)) => warn!(scheduler = %self.name, error = %e, "tick loop join failed"),
            Err(_) => {
                warn!(
                    scheduler = %self.name,
                    timeout = ?self.shutdown_timeout,
                    "tick loop did not wind down in time, aborting in-flight tick",
                );
                handle.abort();
                if tokio::time::timeout(self.shutdown_timeout, handle)
                    .await
                    .is_err()
                {
                    error!(scheduler = %self.name, "tick loop did not terminate");
                }
            }
        }
    }

    /// Blocks until the tick loop terminates, then performs the same bounded
    /// shutdown as `stop`.
    ///
    /// The loop only terminates through `stop` (from another task) or if it
    /// dies unexpectedly.
    pub async fn wait(&self) -> Result<(), SchedulerError> {
        if !matches!(*self.state.lock(), State::Running(_)) {
            return Err(SchedulerError::NotRunning);
        }

        self.finished.cancelled().await;
        info!(scheduler = %self.name, "tick loop terminated, cleaning up");
        self.stop().await;
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop<T: Tick>(
    name: Arc<str>,
    op: Arc<T>,
    interval: Duration,
    initial_delay: Duration,
    cancel: CancellationToken,
    finished: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) {
    // Fires `finished` however this task ends, including abort.
    let _finished = finished.drop_guard();

    let start = tokio::time::Instant::now() + initial_delay;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut watermark: Option<SystemTime> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(scheduler = %name, "tick loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                run_tick(&name, &op, watermark, health.as_deref()).await;
                // Advances on failure too.
                watermark = Some(SystemTime::now());
            }
        }
    }
}

/// Runs one tick in its own task so a panic cannot take the loop down.
/// Aborting the loop aborts the tick with it.
async fn run_tick<T: Tick>(
    name: &str,
    op: &Arc<T>,
    since: Option<SystemTime>,
    health: Option<&HealthMetrics>,
) {
    let started = Instant::now();
    let op = Arc::clone(op);
    let task = AbortOnDropHandle::new(tokio::spawn(async move { op.run(since).await }));

    let outcome = task.await;
    let elapsed = started.elapsed();

    if let Some(h) = health {
        h.ticks_total.inc();
        h.tick_duration.observe(elapsed.as_secs_f64());
    }

    match outcome {
        Ok(Ok(())) => debug!(scheduler = %name, ?elapsed, "tick completed"),
        Ok(Err(e)) => {
            if let Some(h) = health {
                h.tick_failures_total.inc();
            }
            warn!(scheduler = %name, error = %format!("{e:#}"), "tick failed");
        }
        Err(e) => {
            if let Some(h) = health {
                h.tick_failures_total.inc();
            }
            error!(scheduler = %name, error = %e, "tick aborted unexpectedly");
        }
    }
}
