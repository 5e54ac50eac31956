//! Dispatch scheduling
//!
//! A [`DispatchScheduler`] drives a [`Dispatcher`] from a timer: one
//! delayed attempt after [`start`](DispatchScheduler::start), then one
//! per interval. Manual attempts via
//! [`dispatch_now`](DispatchScheduler::dispatch_now) are always
//! available, whatever the timer is doing; the dispatch lock keeps them
//! from overlapping with timer attempts.
//!
//! Each armed timer owns a cancellation token. Stopping or re-arming
//! cancels it, so a tick that has already fired but not yet run becomes
//! a no-op. An attempt that is already past the lock runs to completion.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::interval_from_secs;
use crate::dispatch::{DispatchAttempt, DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::reachability::ReachabilityProbe;
use crate::transport::Transport;

/// Externally visible scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No timer armed; manual dispatch only
    Idle,
    /// Timer armed, no attempt running
    Waiting,
    /// An attempt is running
    Dispatching,
    /// Stopped by [`DispatchScheduler::stop`] until started again
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    Idle,
    Armed,
    Stopped,
}

struct Timer {
    mode: TimerMode,
    interval: Option<Duration>,
    token: Option<CancellationToken>,
    /// Bumped on every re-arm so a retired timer task cannot change the mode
    generation: u64,
}

struct Shared<T, P> {
    dispatcher: Arc<Dispatcher<T, P>>,
    timer: Mutex<Timer>,
    inflight: AtomicUsize,
    attempts: AtomicU64,
    last_outcome: Mutex<Option<DispatchOutcome>>,
}

/// Periodic and on-demand driver for a [`Dispatcher`]
pub struct DispatchScheduler<T, P> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P> DispatchScheduler<T, P>
where
    T: Transport + 'static,
    P: ReachabilityProbe + 'static,
{
    /// Create an idle scheduler
    ///
    /// `interval` is remembered for [`start`](Self::start) callers that
    /// want the configured period.
    pub fn new(dispatcher: Arc<Dispatcher<T, P>>, interval: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                timer: Mutex::new(Timer {
                    mode: TimerMode::Idle,
                    interval,
                    token: None,
                    generation: 0,
                }),
                inflight: AtomicUsize::new(0),
                attempts: AtomicU64::new(0),
                last_outcome: Mutex::new(None),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<T, P>> {
        &self.shared.dispatcher
    }

    /// Current state
    pub fn state(&self) -> SchedulerState {
        if self.shared.inflight.load(Ordering::SeqCst) > 0 {
            return SchedulerState::Dispatching;
        }
        match self.shared.timer().mode {
            TimerMode::Idle => SchedulerState::Idle,
            TimerMode::Armed => SchedulerState::Waiting,
            TimerMode::Stopped => SchedulerState::Stopped,
        }
    }

    /// Current periodic interval, `None` when periodic dispatch is off
    pub fn interval(&self) -> Option<Duration> {
        self.shared.timer().interval
    }

    /// Number of attempts run so far, skipped ones included
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Outcome of the most recent attempt
    pub fn last_outcome(&self) -> Option<DispatchOutcome> {
        self.shared.lock_last_outcome().clone()
    }

    /// Arm the timer: one attempt after `initial_delay`, then one every
    /// `interval` (if any)
    ///
    /// Replaces a timer that is already armed. Fails with
    /// [`Error::Config`], leaving the state unchanged, when called outside
    /// a Tokio runtime.
    pub fn start(&self, interval: Option<Duration>, initial_delay: Duration) -> Result<()> {
        let handle = timer_runtime()?;
        let (token, generation) = {
            let mut timer = self.shared.timer();
            timer.interval = interval;
            Self::arm(&mut timer)
        };
        tracing::info!(
            interval_secs = interval.map(|d| d.as_secs()),
            initial_delay_secs = initial_delay.as_secs(),
            "Dispatch scheduler started"
        );
        self.spawn_timer(&handle, token, generation, Some(initial_delay), interval);
        Ok(())
    }

    /// Cancel the timer; attempts already running finish normally
    pub fn stop(&self) {
        let mut timer = self.shared.timer();
        if let Some(token) = timer.token.take() {
            token.cancel();
        }
        timer.generation += 1;
        timer.mode = TimerMode::Stopped;
        tracing::info!("Dispatch scheduler stopped");
    }

    /// Change the periodic interval
    ///
    /// Zero or negative disables periodic dispatch. Otherwise the timer
    /// is (re-)armed with the new period, without an immediate attempt.
    /// A stopped scheduler only keeps the value for its next start.
    /// Arming outside a Tokio runtime fails with [`Error::Config`] and
    /// changes nothing.
    pub fn set_interval(&self, secs: i64) -> Result<()> {
        let interval = interval_from_secs(secs);
        let armed = {
            let mut timer = self.shared.timer();
            let handle = match (timer.mode, interval) {
                (TimerMode::Stopped, _) | (_, None) => None,
                (_, Some(_)) => Some(timer_runtime()?),
            };
            timer.interval = interval;
            match (timer.mode, handle) {
                (TimerMode::Stopped, _) => None,
                (_, Some(handle)) => Some((handle, Self::arm(&mut timer))),
                (_, None) => {
                    if let Some(token) = timer.token.take() {
                        token.cancel();
                    }
                    timer.generation += 1;
                    timer.mode = TimerMode::Idle;
                    None
                }
            }
        };
        tracing::debug!(interval_secs = secs, "Dispatch interval changed");
        if let Some((handle, (token, generation))) = armed {
            self.spawn_timer(&handle, token, generation, None, interval);
        }
        Ok(())
    }

    /// Run one attempt now and wait for it
    pub async fn dispatch_now(&self) -> DispatchAttempt {
        self.shared.run_attempt().await
    }

    /// Cancel any armed timer and install a fresh token
    fn arm(timer: &mut Timer) -> (CancellationToken, u64) {
        if let Some(token) = timer.token.take() {
            token.cancel();
        }
        let token = CancellationToken::new();
        timer.token = Some(token.clone());
        timer.generation += 1;
        timer.mode = TimerMode::Armed;
        (token, timer.generation)
    }

    fn spawn_timer(
        &self,
        handle: &Handle,
        token: CancellationToken,
        generation: u64,
        first_delay: Option<Duration>,
        interval: Option<Duration>,
    ) {
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            shared.run_timer(token, generation, first_delay, interval).await;
        });
    }
}

/// Runtime the dispatch timer is spawned on
pub(crate) fn timer_runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|_| Error::Config("dispatch timer requires a Tokio runtime".to_string()))
}

impl<T, P> Drop for DispatchScheduler<T, P> {
    fn drop(&mut self) {
        if let Some(token) = self.shared.timer().token.take() {
            token.cancel();
        }
    }
}

impl<T, P> Shared<T, P> {
    fn timer(&self) -> MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_last_outcome(&self) -> MutexGuard<'_, Option<DispatchOutcome>> {
        self.last_outcome.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Transport, P: ReachabilityProbe> Shared<T, P> {
    async fn run_timer(
        &self,
        token: CancellationToken,
        generation: u64,
        first_delay: Option<Duration>,
        interval: Option<Duration>,
    ) {
        if let Some(delay) = first_delay {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.fire(&token).await;
        }

        let Some(period) = interval else {
            // One-shot start without a period: fall back to manual dispatch
            let mut timer = self.timer();
            if timer.generation == generation && timer.mode == TimerMode::Armed {
                timer.mode = TimerMode::Idle;
                timer.token = None;
            }
            return;
        };

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.fire(&token).await,
            }
        }
    }

    async fn fire(&self, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        self.run_attempt().await;
    }

    async fn run_attempt(&self) -> DispatchAttempt {
        let inflight = InflightGuard::enter(&self.inflight);
        let attempt = self.dispatcher.dispatch_once().await;
        *self.lock_last_outcome() = Some(attempt.outcome.clone());
        drop(inflight);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        attempt
    }
}

/// Counts an attempt as running for its whole lifetime
struct InflightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InflightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
