use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(feature = "logging")]
use log::debug;

use crate::scheduler::lock;
use crate::timer::Timer;
use crate::TimerError;

/// A manager for controlling multiple timers.
pub struct TimerManager<C: Send + Sync + 'static = ()> {
    timers: Arc<Mutex<HashMap<u64, Timer<C>>>>,
    next_id: Arc<Mutex<u64>>,
}

impl<C: Send + Sync + 'static> TimerManager<C> {
    /// Creates a new timer manager.
    pub fn new() -> Self {
        TimerManager {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(0)),
        }
    }

    /// Adds a timer to the manager and returns its ID.
    pub fn add_timer(&self, timer: Timer<C>) -> u64 {
        let mut timers = lock(&self.timers);
        let mut next_id = lock(&self.next_id);
        let id = *next_id;
        *next_id += 1;

        timers.insert(id, timer);
        id
    }

    /// Retrieves a timer by ID.
    pub fn get_timer(&self, id: u64) -> Option<Timer<C>> {
        lock(&self.timers).get(&id).cloned()
    }

    /// Removes a timer from the manager and deletes it.
    pub fn remove_timer(&self, id: u64) -> Result<(), TimerError> {
        let timer = lock(&self.timers)
            .remove(&id)
            .ok_or_else(|| TimerError::InvalidParameter(format!("No timer with id {id}.")))?;
        timer.delete()
    }

    /// Cancels every timer that is not already cancelled or deleted and
    /// returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let timers = lock(&self.timers);
        let cancelled = timers
            .values()
            .filter(|timer| !timer.get_state().is_terminal())
            .filter(|timer| timer.cancel().is_ok())
            .count();

        #[cfg(feature = "logging")]
        debug!("Cancelled {} timers.", cancelled);
        cancelled
    }

    /// Lists the IDs of all armed timers, in ascending order.
    pub fn list_timers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.timers)
            .iter()
            .filter_map(|(id, timer)| {
                if timer.get_state().is_armed() {
                    Some(*id)
                } else {
                    None
                }
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of timers held, whatever their state.
    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Send + Sync + 'static> Default for TimerManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ManualScheduler;
    use crate::state::TimerState;
    use crate::TimerBuilder;

    fn timer(scheduler: &ManualScheduler) -> Timer {
        TimerBuilder::new()
            .callback_fn(|_, _| {})
            .initial_delay_ms(100)
            .interval_ms(100)
            .setup(scheduler)
            .unwrap()
    }

    #[test]
    fn tracks_armed_timers() {
        let scheduler = ManualScheduler::new();
        let manager = TimerManager::new();

        let idle = manager.add_timer(timer(&scheduler));
        let running = manager.add_timer(timer(&scheduler));
        manager.get_timer(running).unwrap().start().unwrap();

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.list_timers(), vec![running]);
        assert_eq!(
            manager.get_timer(idle).unwrap().get_state(),
            TimerState::Init
        );
    }

    #[test]
    fn cancel_all_skips_finished_timers() {
        let scheduler = ManualScheduler::new();
        let manager = TimerManager::new();
        for _ in 0..3 {
            let id = manager.add_timer(timer(&scheduler));
            manager.get_timer(id).unwrap().start().unwrap();
        }
        let first = manager.list_timers()[0];
        manager.get_timer(first).unwrap().cancel().unwrap();

        assert_eq!(manager.cancel_all(), 2);
        assert!(manager.list_timers().is_empty());
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[test]
    fn remove_deletes_the_timer() {
        let scheduler = ManualScheduler::new();
        let manager = TimerManager::new();
        let id = manager.add_timer(timer(&scheduler));
        let handle = manager.get_timer(id).unwrap();

        manager.remove_timer(id).unwrap();
        assert!(manager.is_empty());
        assert_eq!(handle.get_state(), TimerState::Deleted);
        assert!(handle.start().is_err());
        assert!(matches!(
            manager.remove_timer(id),
            Err(TimerError::InvalidParameter(_))
        ));
    }
}
