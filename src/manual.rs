//! A deterministic scheduler driven by a virtual clock.
//!
//! Nothing fires until [`ManualScheduler::advance`] moves the clock. Due
//! expirations are delivered in deadline order (ties broken by creation
//! order) and each dispatch is awaited before the next one is looked up, so
//! a test sees the exact same sequence on every run.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "logging")]
use log::trace;

use crate::errors::TimerError;
use crate::interval::TimerSpec;
use crate::scheduler::{lock, Expiry, Scheduler, TimerEngine, DUE};

#[derive(Default)]
struct Entry {
    deadline: Option<Duration>,
    interval: Duration,
    expiry: Option<Expiry>,
}

#[derive(Default)]
struct Clock {
    now: Duration,
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    capacity: Option<usize>,
    failing: bool,
    fired: u64,
}

impl Clock {
    fn check(&self) -> Result<(), TimerError> {
        if self.failing {
            Err(TimerError::BackendFailure("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn entry(&mut self, id: u64) -> Result<&mut Entry, TimerError> {
        self.entries.get_mut(&id).ok_or_else(|| {
            TimerError::BackendFailure("timer resource already released".into())
        })
    }

    /// Pops the earliest expiration due at or before `until`, advancing the
    /// clock to it and scheduling the following one.
    fn take_due(&mut self, until: Duration) -> Option<Expiry> {
        let (id, deadline) = self
            .entries
            .iter()
            .filter_map(|(id, entry)| entry.deadline.map(|deadline| (*id, deadline)))
            .filter(|(_, deadline)| *deadline <= until)
            .min_by_key(|(id, deadline)| (*deadline, *id))?;

        self.now = self.now.max(deadline);
        self.fired += 1;
        let entry = self.entries.get_mut(&id)?;
        if entry.interval.is_zero() {
            entry.deadline = None;
            entry.expiry.take()
        } else {
            entry.deadline = Some(deadline + entry.interval);
            entry.expiry.clone()
        }
    }
}

/// Fake-clock scheduler for tests and simulations.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<Clock>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler that refuses to hold more than `capacity` live
    /// timers at once.
    pub fn with_capacity(capacity: usize) -> Self {
        let scheduler = Self::default();
        lock(&scheduler.clock).capacity = Some(capacity);
        scheduler
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        lock(&self.clock).now
    }

    /// Number of engines currently armed.
    pub fn armed_count(&self) -> usize {
        lock(&self.clock)
            .entries
            .values()
            .filter(|entry| entry.deadline.is_some())
            .count()
    }

    /// Total number of expirations delivered so far.
    pub fn fired_count(&self) -> u64 {
        lock(&self.clock).fired
    }

    /// Makes every engine operation fail with [`TimerError::BackendFailure`]
    /// while `failing` is set.
    pub fn fail_operations(&self, failing: bool) {
        lock(&self.clock).failing = failing;
    }

    /// Moves the clock forward by `by`, delivering every expiration that
    /// falls due on the way. Returns the number of expirations delivered.
    pub async fn advance(&self, by: Duration) -> usize {
        let until = lock(&self.clock).now + by;
        let mut delivered = 0;
        loop {
            let expiry = lock(&self.clock).take_due(until);
            match expiry {
                Some(expiry) => {
                    #[cfg(feature = "logging")]
                    trace!("Manual scheduler firing expiration.");
                    expiry().await;
                    delivered += 1;
                }
                None => break,
            }
        }
        let mut clock = lock(&self.clock);
        clock.now = clock.now.max(until);
        delivered
    }
}

impl Scheduler for ManualScheduler {
    fn create(&self) -> Result<Box<dyn TimerEngine>, TimerError> {
        let mut clock = lock(&self.clock);
        clock.check()?;
        if let Some(capacity) = clock.capacity {
            if clock.entries.len() >= capacity {
                return Err(TimerError::ResourceExhausted(format!(
                    "{capacity} manual timers in use"
                )));
            }
        }
        let id = clock.next_id;
        clock.next_id += 1;
        clock.entries.insert(id, Entry::default());
        Ok(Box::new(ManualEngine {
            id,
            clock: Arc::clone(&self.clock),
        }))
    }
}

struct ManualEngine {
    id: u64,
    clock: Arc<Mutex<Clock>>,
}

impl TimerEngine for ManualEngine {
    fn arm(&self, spec: TimerSpec, expiry: Expiry) -> Result<(), TimerError> {
        let mut clock = lock(&self.clock);
        clock.check()?;
        let now = clock.now;
        let entry = clock.entry(self.id)?;
        if spec.is_disarmed() {
            *entry = Entry::default();
        } else {
            entry.deadline = Some(now + spec.value.as_duration());
            entry.interval = spec.interval.as_duration();
            entry.expiry = Some(expiry);
        }
        Ok(())
    }

    fn disarm(&self) -> Result<(), TimerError> {
        let mut clock = lock(&self.clock);
        clock.check()?;
        *clock.entry(self.id)? = Entry::default();
        Ok(())
    }

    fn remaining(&self) -> Result<TimerSpec, TimerError> {
        let mut clock = lock(&self.clock);
        clock.check()?;
        let now = clock.now;
        let entry = clock.entry(self.id)?;
        Ok(match entry.deadline {
            Some(deadline) => {
                TimerSpec::new(deadline.saturating_sub(now).max(DUE), entry.interval)
            }
            None => TimerSpec::DISARMED,
        })
    }

    fn release(&self) -> Result<(), TimerError> {
        let mut clock = lock(&self.clock);
        clock.check()?;
        clock
            .entries
            .remove(&self.id)
            .map(|_| ())
            .ok_or_else(|| TimerError::BackendFailure("timer resource already released".into()))
    }
}

impl Drop for ManualEngine {
    fn drop(&mut self) {
        lock(&self.clock).entries.remove(&self.id);
    }
}
