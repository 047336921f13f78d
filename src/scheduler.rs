//! Scheduler backends that arm, disarm and query timer resources.
//!
//! A [`Scheduler`] hands out one [`TimerEngine`] per timer. Engines deliver
//! every expiration by calling the [`Expiry`] they were armed with on a
//! freshly spawned task, so two firings of a fast periodic timer may run
//! concurrently with each other and with the caller's control operations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
#[cfg(feature = "logging")]
use log::{debug, trace};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::errors::TimerError;
use crate::interval::TimerSpec;

/// Smallest remaining time an armed engine reports, so that a deadline that
/// is due but not yet delivered never reads as disarmed.
pub(crate) const DUE: Duration = Duration::from_nanos(1);

/// Notification invoked once per expiration.
pub type Expiry = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Allocates timer resources.
pub trait Scheduler: Send + Sync {
    /// Creates a disarmed engine, failing with
    /// [`TimerError::ResourceExhausted`] when no resource is left.
    fn create(&self) -> Result<Box<dyn TimerEngine>, TimerError>;
}

/// A single timer resource.
pub trait TimerEngine: Send + Sync {
    /// Schedules `expiry` after `spec.value`, then every `spec.interval`.
    ///
    /// Replaces any previous arming. A zero `spec.value` disarms.
    fn arm(&self, spec: TimerSpec, expiry: Expiry) -> Result<(), TimerError>;

    /// Stops all future notifications.
    fn disarm(&self) -> Result<(), TimerError>;

    /// Time left until the next expiration and the repeat interval; all zero
    /// while disarmed and never zero while armed.
    fn remaining(&self) -> Result<TimerSpec, TimerError>;

    /// Disarms and gives the resource back. Every later call fails with
    /// [`TimerError::BackendFailure`].
    fn release(&self) -> Result<(), TimerError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler backed by the tokio timer wheel of the current runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    capacity: Option<usize>,
    live: Arc<AtomicUsize>,
}

impl TokioScheduler {
    /// Creates a scheduler without a limit on live timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler that refuses to hold more than `capacity` live
    /// timers at once.
    pub fn with_capacity(capacity: usize) -> Self {
        TokioScheduler {
            capacity: Some(capacity),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of engines created and not yet released.
    pub fn live_timers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn reserve(&self) -> Result<(), TimerError> {
        let limit = self.capacity.unwrap_or(usize::MAX);
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|live| {
                TimerError::ResourceExhausted(format!("{live} of {limit} timers in use"))
            })
    }
}

impl Scheduler for TokioScheduler {
    fn create(&self) -> Result<Box<dyn TimerEngine>, TimerError> {
        let runtime = Handle::try_current()
            .map_err(|e| TimerError::BackendFailure(format!("no tokio runtime: {e}")))?;
        self.reserve()?;

        #[cfg(feature = "logging")]
        debug!("Allocated tokio timer engine.");

        Ok(Box::new(TokioEngine {
            runtime,
            slot: Arc::new(Mutex::new(Slot::default())),
            live: Arc::clone(&self.live),
        }))
    }
}

#[derive(Default)]
struct Slot {
    deadline: Option<Instant>,
    interval: Duration,
    epoch: u64,
    task: Option<JoinHandle<()>>,
    released: bool,
}

impl Slot {
    fn stop(&mut self) {
        self.epoch += 1;
        self.deadline = None;
        self.interval = Duration::ZERO;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn check_live(&self) -> Result<(), TimerError> {
        if self.released {
            Err(TimerError::BackendFailure(
                "timer resource already released".into(),
            ))
        } else {
            Ok(())
        }
    }
}

struct TokioEngine {
    runtime: Handle,
    slot: Arc<Mutex<Slot>>,
    live: Arc<AtomicUsize>,
}

impl TimerEngine for TokioEngine {
    fn arm(&self, spec: TimerSpec, expiry: Expiry) -> Result<(), TimerError> {
        let mut slot = lock(&self.slot);
        slot.check_live()?;
        slot.stop();
        if spec.is_disarmed() {
            return Ok(());
        }

        let first = Instant::now() + spec.value.as_duration();
        let interval = spec.interval.as_duration();
        slot.deadline = Some(first);
        slot.interval = interval;

        let epoch = slot.epoch;
        let shared = Arc::clone(&self.slot);
        let runtime = self.runtime.clone();
        slot.task = Some(self.runtime.spawn(async move {
            let mut deadline = first;
            loop {
                time::sleep_until(deadline).await;

                let next = if interval.is_zero() {
                    None
                } else {
                    let now = Instant::now();
                    let mut next = deadline + interval;
                    // Skip ticks that were missed while the runtime was busy.
                    while next <= now {
                        next += interval;
                    }
                    Some(next)
                };

                {
                    let mut slot = lock(&shared);
                    if slot.epoch != epoch {
                        return;
                    }
                    slot.deadline = next;
                    if next.is_none() {
                        slot.task = None;
                    }
                }

                #[cfg(feature = "logging")]
                trace!("Tokio timer engine fired.");
                runtime.spawn(expiry());

                match next {
                    Some(next) => deadline = next,
                    None => return,
                }
            }
        }));
        Ok(())
    }

    fn disarm(&self) -> Result<(), TimerError> {
        let mut slot = lock(&self.slot);
        slot.check_live()?;
        slot.stop();
        Ok(())
    }

    fn remaining(&self) -> Result<TimerSpec, TimerError> {
        let slot = lock(&self.slot);
        slot.check_live()?;
        Ok(match slot.deadline {
            Some(deadline) => TimerSpec::new(
                deadline.saturating_duration_since(Instant::now()).max(DUE),
                slot.interval,
            ),
            None => TimerSpec::DISARMED,
        })
    }

    fn release(&self) -> Result<(), TimerError> {
        let mut slot = lock(&self.slot);
        slot.check_live()?;
        slot.stop();
        slot.released = true;
        self.live.fetch_sub(1, Ordering::AcqRel);

        #[cfg(feature = "logging")]
        debug!("Released tokio timer engine.");
        Ok(())
    }
}

impl Drop for TokioEngine {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if !slot.released {
            slot.stop();
            slot.released = true;
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicU32;

    fn counting_expiry(count: &Arc<AtomicU32>) -> Expiry {
        let count = Arc::clone(count);
        Arc::new(move || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let engine = TokioScheduler::new().create().unwrap();
        let count = Arc::new(AtomicU32::new(0));
        engine
            .arm(TimerSpec::from_millis(100, 0), counting_expiry(&count))
            .unwrap();

        time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(engine.remaining().unwrap().is_disarmed());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_every_interval() {
        let engine = TokioScheduler::new().create().unwrap();
        let count = Arc::new(AtomicU32::new(0));
        engine
            .arm(TimerSpec::from_millis(100, 50), counting_expiry(&count))
            .unwrap();

        time::sleep(Duration::from_millis(260)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        let remaining = engine.remaining().unwrap();
        assert_eq!(remaining.value.as_duration(), Duration::from_millis(40));
        assert_eq!(remaining.interval.as_duration(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_stops_notifications() {
        let engine = TokioScheduler::new().create().unwrap();
        let count = Arc::new(AtomicU32::new(0));
        engine
            .arm(TimerSpec::from_millis(10, 10), counting_expiry(&count))
            .unwrap();
        time::sleep(Duration::from_millis(25)).await;
        engine.disarm().unwrap();
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.remaining().unwrap(), TimerSpec::DISARMED);
    }

    #[tokio::test]
    async fn capacity_limits_live_engines() {
        let scheduler = TokioScheduler::with_capacity(1);
        let first = scheduler.create().unwrap();
        assert!(matches!(
            scheduler.create(),
            Err(TimerError::ResourceExhausted(_))
        ));

        first.release().unwrap();
        assert_eq!(scheduler.live_timers(), 0);
        assert!(matches!(
            first.disarm(),
            Err(TimerError::BackendFailure(_))
        ));

        let second = scheduler.create().unwrap();
        drop(second);
        assert_eq!(scheduler.live_timers(), 0);
    }

    #[test]
    fn create_requires_a_runtime() {
        assert!(matches!(
            TokioScheduler::new().create(),
            Err(TimerError::BackendFailure(_))
        ));
    }
}
