use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
#[cfg(feature = "logging")]
use log::{debug, error, trace};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::builder::TimerBuilder;
use crate::errors::{CallbackFailure, FailureKind, TimerError};
use crate::interval::{from_interval, to_interval, TimerSpec};
use crate::scheduler::{lock, Expiry, Scheduler, TimerEngine};
use crate::state::{TimerState, Trigger};

/// Statistics for a timer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerStatistics {
    /// Number of expirations delivered to the callback.
    pub invocation_count: u32,
    /// Number of callback runs that returned an error or panicked.
    pub callback_failures: u32,
    /// Time since the timer was last started.
    pub elapsed_time: Duration,
}

/// A trait for timer callbacks.
///
/// Plain closures taking `(&Timer<C>, &C)` implement it as well.
#[async_trait]
pub trait TimerCallback<C = ()>: Send + Sync
where
    C: Send + Sync + 'static,
{
    /// The function to execute on every expiration.
    async fn execute(&self, timer: &Timer<C>, context: &C) -> Result<(), TimerError>;
}

#[async_trait]
impl<C, F> TimerCallback<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(&Timer<C>, &C) + Send + Sync,
{
    async fn execute(&self, timer: &Timer<C>, context: &C) -> Result<(), TimerError> {
        self(timer, context);
        Ok(())
    }
}

/// Configuration fixed at setup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub threshold: u32,
    pub exponential_backoff: bool,
}

struct Core {
    state: TimerState,
    invocation_counter: u32,
    callback_failures: u32,
    /// Bumped by start, cancel, delete and exhaustion; expirations carrying
    /// an older value are stale and dropped.
    epoch: u64,
    /// Bumped on every arm and disarm. Only an expiration of the current
    /// arming moves the state; older ones are still counted.
    arming: u64,
    started_at: Option<Instant>,
}

struct Inner<C: Send + Sync + 'static> {
    core: Mutex<Core>,
    engine: Box<dyn TimerEngine>,
    callback: Box<dyn TimerCallback<C>>,
    context: Arc<C>,
    settings: Settings,
    failures: Option<UnboundedSender<CallbackFailure>>,
}

/// Handle to a pausable one-shot or periodic timer.
///
/// Clones share the same timer. The handle passed to the callback is one of
/// these clones, so the callback may pause or cancel its own timer.
pub struct Timer<C: Send + Sync + 'static = ()> {
    inner: Arc<Inner<C>>,
}

impl<C: Send + Sync + 'static> Clone for Timer<C> {
    fn clone(&self) -> Self {
        Timer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Timer<()> {
    /// Starts configuring a timer without user context.
    pub fn builder() -> TimerBuilder<()> {
        TimerBuilder::new()
    }
}

impl<C: Send + Sync + 'static> Timer<C> {
    /// Allocates a scheduler resource and returns a timer in [`TimerState::Init`].
    ///
    /// `interval_ms == 0` makes the timer one-shot and `threshold == 0`
    /// leaves the number of invocations unbounded.
    pub fn setup<F>(
        scheduler: &dyn Scheduler,
        callback: F,
        initial_delay_ms: u64,
        interval_ms: u64,
        threshold: u32,
        context: Arc<C>,
        exponential_backoff: bool,
    ) -> Result<Self, TimerError>
    where
        F: TimerCallback<C> + 'static,
    {
        TimerBuilder::with_context(context)
            .callback(callback)
            .initial_delay_ms(initial_delay_ms)
            .interval_ms(interval_ms)
            .threshold(threshold)
            .exponential_backoff(exponential_backoff)
            .setup(scheduler)
    }

    pub(crate) fn from_parts(
        engine: Box<dyn TimerEngine>,
        callback: Box<dyn TimerCallback<C>>,
        context: Arc<C>,
        settings: Settings,
        failures: Option<UnboundedSender<CallbackFailure>>,
    ) -> Self {
        Timer {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: TimerState::Init,
                    invocation_counter: 0,
                    callback_failures: 0,
                    epoch: 0,
                    arming: 0,
                    started_at: None,
                }),
                engine,
                callback,
                context,
                settings,
                failures,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.inner.core)
    }

    /// Arms the timer with its initial delay and interval.
    ///
    /// Accepted from [`TimerState::Init`] and, to restart a timer, from
    /// [`TimerState::Cancelled`]; a restart resets the invocation counter.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut core = self.core();
        let next = core.state.transition(Trigger::Start)?;

        let settings = self.inner.settings;
        let (epoch, arming) = (core.epoch + 1, core.arming + 1);
        self.inner.engine.arm(
            TimerSpec::from_millis(settings.initial_delay_ms, settings.interval_ms),
            self.expiry(epoch, arming),
        )?;

        if core.state == TimerState::Cancelled {
            core.invocation_counter = 0;
        }
        core.epoch = epoch;
        core.arming = arming;
        core.state = next;
        core.started_at = Some(Instant::now());

        #[cfg(feature = "logging")]
        debug!(
            "Timer started: delay {} ms, interval {} ms.",
            settings.initial_delay_ms, settings.interval_ms
        );
        Ok(())
    }

    /// Disarms a running timer, keeping the exact time left until its next
    /// expiration.
    ///
    /// An expiration the scheduler emitted before the pause is still
    /// delivered and counted; the captured time is the one until the
    /// expiration after it. A one-shot that already fired has nothing left to
    /// pause and is refused.
    pub fn pause(&self) -> Result<(), TimerError> {
        let mut core = self.core();
        let remaining = if core.state == TimerState::Running {
            let spec = self.inner.engine.remaining()?;
            if spec.is_disarmed() {
                return Err(TimerError::InvalidStateTransition {
                    from: core.state,
                    trigger: "pause",
                });
            }
            spec.value.as_duration()
        } else {
            Duration::ZERO
        };
        let next = core.state.transition(Trigger::Pause { remaining })?;

        self.inner.engine.disarm()?;
        core.arming += 1;
        core.state = next;

        #[cfg(feature = "logging")]
        debug!("Timer paused with {:?} remaining.", remaining);
        Ok(())
    }

    /// Re-arms a paused timer: the next expiration comes after the time that
    /// was left at pause, later ones every interval.
    pub fn resume(&self) -> Result<(), TimerError> {
        let mut core = self.core();
        // Non-zero once paused: armed engines report at least `DUE`.
        let remaining = core.state.remaining();
        let next = core.state.transition(Trigger::Resume)?;

        let arming = core.arming + 1;
        self.inner.engine.arm(
            TimerSpec {
                value: remaining.into(),
                interval: to_interval(self.inner.settings.interval_ms),
            },
            self.expiry(core.epoch, arming),
        )?;
        core.arming = arming;
        core.state = next;

        #[cfg(feature = "logging")]
        debug!("Timer resumed, next expiration in {:?}.", remaining);
        Ok(())
    }

    /// Disarms the timer. No expiration is dispatched once this returns.
    pub fn cancel(&self) -> Result<(), TimerError> {
        let mut core = self.core();
        let next = core.state.transition(Trigger::Cancel)?;

        self.inner.engine.disarm()?;
        core.epoch += 1;
        core.arming += 1;
        core.state = next;

        #[cfg(feature = "logging")]
        debug!("Timer cancelled.");
        Ok(())
    }

    /// Disarms the timer and releases its scheduler resource.
    ///
    /// Other clones of this handle observe [`TimerState::Deleted`] and every
    /// further operation on them fails. The user context is left alone: a
    /// callback still running keeps its own reference to it.
    pub fn delete(self) -> Result<(), TimerError> {
        let mut core = self.core();
        let next = core.state.transition(Trigger::Delete)?;

        self.inner.engine.release()?;
        core.epoch += 1;
        core.arming += 1;
        core.state = next;

        #[cfg(feature = "logging")]
        debug!("Timer deleted.");
        Ok(())
    }

    /// Time until the next expiration, read live from the scheduler.
    ///
    /// A paused timer reports the time frozen at pause instead: its engine is
    /// disarmed and would read zero, which would lose the value `resume`
    /// re-arms with. Any other disarmed timer reports zero.
    pub fn get_remaining_ms(&self) -> Result<u64, TimerError> {
        let core = self.core();
        if let TimerState::Paused { remaining } = core.state {
            return Ok(from_interval(remaining.into()));
        }
        let spec = self.inner.engine.remaining()?;
        Ok(from_interval(spec.value))
    }

    /// Gets the current state of the timer.
    pub fn get_state(&self) -> TimerState {
        self.core().state
    }

    /// Number of expirations delivered so far.
    pub fn invocation_count(&self) -> u32 {
        self.core().invocation_counter
    }

    /// Gets the timer's statistics.
    pub fn get_statistics(&self) -> TimerStatistics {
        let core = self.core();
        TimerStatistics {
            invocation_count: core.invocation_counter,
            callback_failures: core.callback_failures,
            elapsed_time: core
                .started_at
                .map(|started| started.elapsed())
                .unwrap_or_default(),
        }
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.inner.settings.initial_delay_ms
    }

    pub fn interval_ms(&self) -> u64 {
        self.inner.settings.interval_ms
    }

    pub fn is_periodic(&self) -> bool {
        self.inner.settings.interval_ms != 0
    }

    pub fn threshold(&self) -> u32 {
        self.inner.settings.threshold
    }

    // TODO: grow the interval between firings once a growth factor and cap
    // are chosen; until then the flag is only recorded.
    pub fn exponential_backoff(&self) -> bool {
        self.inner.settings.exponential_backoff
    }

    /// The user context shared with the callback.
    pub fn context(&self) -> &Arc<C> {
        &self.inner.context
    }

    fn expiry(&self, epoch: u64, arming: u64) -> Expiry {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move || dispatch(Weak::clone(&inner), epoch, arming).boxed())
    }

    /// Locked part of an expiration. Returns the invocation number when the
    /// expiration still belongs to this run of the timer and the callback
    /// should run.
    fn record_expiration(&self, epoch: u64, arming: u64) -> Option<u32> {
        let mut core = self.core();
        if core.epoch != epoch {
            #[cfg(feature = "logging")]
            trace!("Discarding expiration from a cancelled run.");
            return None;
        }
        // Emitted before a pause or resume: counted, state left alone.
        if core.arming == arming {
            core.state = core.state.transition(Trigger::Expire).ok()?;
        }
        core.invocation_counter = core.invocation_counter.saturating_add(1);

        let threshold = self.inner.settings.threshold;
        if threshold != 0 && core.invocation_counter >= threshold {
            if let Err(_e) = self.inner.engine.disarm() {
                #[cfg(feature = "logging")]
                error!("Failed to disarm exhausted timer: {}", _e);
            }
            core.epoch += 1;
            core.arming += 1;
            core.state = core.state.transition(Trigger::Exhaust).ok()?;

            #[cfg(feature = "logging")]
            debug!("Timer reached its threshold of {} invocations.", threshold);
        }
        Some(core.invocation_counter)
    }

    fn report_failure(&self, invocation: u32, kind: FailureKind) {
        self.core().callback_failures += 1;

        #[cfg(feature = "logging")]
        error!("Callback execution error on invocation {}: {}", invocation, kind);

        if let Some(failures) = &self.inner.failures {
            let _ = failures.send(CallbackFailure { invocation, kind });
        }
    }
}

/// Runs one expiration: state bookkeeping under the timer lock, then the
/// user callback outside it.
async fn dispatch<C: Send + Sync + 'static>(inner: Weak<Inner<C>>, epoch: u64, arming: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let timer = Timer { inner };
    let Some(invocation) = timer.record_expiration(epoch, arming) else {
        return;
    };

    let context = Arc::clone(&timer.inner.context);
    let outcome = AssertUnwindSafe(timer.inner.callback.execute(&timer, &context))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(FailureKind::Error(e)),
        Err(panic) => Some(FailureKind::Panic(panic_message(panic.as_ref()))),
    };
    if let Some(kind) = failure {
        timer.report_failure(invocation, kind);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    }
}

impl<C: Send + Sync + 'static> fmt::Debug for Timer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        let settings = &self.inner.settings;
        f.debug_struct("Timer")
            .field("state", &core.state)
            .field("invocation_counter", &core.invocation_counter)
            .field("initial_delay_ms", &settings.initial_delay_ms)
            .field("interval_ms", &settings.interval_ms)
            .field("threshold", &settings.threshold)
            .field("exponential_backoff", &settings.exponential_backoff)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ManualScheduler;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(
        scheduler: &ManualScheduler,
        interval_ms: u64,
        threshold: u32,
    ) -> (Timer<AtomicU32>, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let timer = Timer::setup(
            scheduler,
            |_: &Timer<AtomicU32>, fired: &AtomicU32| {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            100,
            interval_ms,
            threshold,
            Arc::clone(&fired),
            false,
        )
        .unwrap();
        (timer, fired)
    }

    /// The expiry an engine would hand out if it fired right now.
    fn emitted(timer: &Timer<AtomicU32>) -> Expiry {
        let core = timer.core();
        timer.expiry(core.epoch, core.arming)
    }

    #[tokio::test]
    async fn expiration_emitted_before_pause_is_counted() {
        let scheduler = ManualScheduler::new();
        let (timer, fired) = counting(&scheduler, 100, 0);
        timer.start().unwrap();

        let in_flight = emitted(&timer);
        timer.pause().unwrap();
        in_flight().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.invocation_count(), 1);
        assert_eq!(
            timer.get_state(),
            TimerState::Paused {
                remaining: Duration::from_millis(100)
            }
        );

        let in_flight = emitted(&timer);
        timer.resume().unwrap();
        in_flight().await;
        assert_eq!(timer.invocation_count(), 2);
        assert_eq!(timer.get_state(), TimerState::Resumed);
        assert_eq!(scheduler.armed_count(), 1);
    }

    #[tokio::test]
    async fn expiration_emitted_before_cancel_is_dropped() {
        let scheduler = ManualScheduler::new();
        let (timer, fired) = counting(&scheduler, 100, 0);
        timer.start().unwrap();

        let in_flight = emitted(&timer);
        timer.cancel().unwrap();
        in_flight().await;
        timer.start().unwrap();
        in_flight().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.invocation_count(), 0);
        assert_eq!(timer.get_state(), TimerState::Running);
    }

    #[tokio::test]
    async fn late_expiration_can_exhaust_a_paused_timer() {
        let scheduler = ManualScheduler::new();
        let (timer, fired) = counting(&scheduler, 100, 1);
        timer.start().unwrap();

        let in_flight = emitted(&timer);
        timer.pause().unwrap();
        in_flight().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.get_state(), TimerState::Cancelled);
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test]
    async fn invocation_counter_saturates() {
        let scheduler = ManualScheduler::new();
        let (timer, _fired) = counting(&scheduler, 100, 0);
        timer.start().unwrap();
        timer.core().invocation_counter = u32::MAX;

        let (epoch, arming) = {
            let core = timer.core();
            (core.epoch, core.arming)
        };
        assert_eq!(timer.record_expiration(epoch, arming), Some(u32::MAX));
        assert_eq!(timer.get_state(), TimerState::Running);
    }
}
