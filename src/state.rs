use std::fmt;
use std::time::Duration;

use crate::errors::TimerError;

/// Represents the state of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Set up but never armed.
    Init,
    /// Armed with the configured delay and interval.
    Running,
    /// Disarmed; holds the exact time that was left until the next expiration.
    Paused { remaining: Duration },
    /// Re-armed from a pause, waiting for its first expiration.
    Resumed,
    /// Disarmed by `cancel` or by reaching the invocation threshold.
    Cancelled,
    /// Disarmed and its scheduler resource released.
    Deleted,
}

/// Events that move a timer between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Pause { remaining: Duration },
    Resume,
    Expire,
    /// The invocation threshold was reached.
    Exhaust,
    Cancel,
    Delete,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::Pause { .. } => "pause",
            Trigger::Resume => "resume",
            Trigger::Expire => "expire",
            Trigger::Exhaust => "exhaust",
            Trigger::Cancel => "cancel",
            Trigger::Delete => "delete",
        }
    }
}

impl TimerState {
    /// Applies `trigger`, returning the next state or an
    /// [`TimerError::InvalidStateTransition`] that leaves `self` untouched.
    pub fn transition(self, trigger: Trigger) -> Result<TimerState, TimerError> {
        use TimerState::*;

        let next = match (self, trigger) {
            (Init | Cancelled, Trigger::Start) => Running,
            (Running, Trigger::Pause { remaining }) => Paused { remaining },
            (Paused { .. }, Trigger::Resume) => Resumed,
            (Running | Resumed, Trigger::Expire) => Running,
            (Running | Paused { .. } | Resumed, Trigger::Exhaust) => Cancelled,
            (Init | Running | Paused { .. } | Resumed, Trigger::Cancel) => Cancelled,
            (state, Trigger::Delete) if state != Deleted => Deleted,
            (from, trigger) => {
                return Err(TimerError::InvalidStateTransition {
                    from,
                    trigger: trigger.name(),
                })
            }
        };
        Ok(next)
    }

    /// Whether the scheduler engine is armed while in this state.
    pub fn is_armed(&self) -> bool {
        matches!(self, TimerState::Running | TimerState::Resumed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerState::Cancelled | TimerState::Deleted)
    }

    /// Time captured at pause; zero in every other state.
    pub fn remaining(&self) -> Duration {
        match self {
            TimerState::Paused { remaining } => *remaining,
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerState::Init => f.write_str("INIT"),
            TimerState::Running => f.write_str("RUNNING"),
            TimerState::Paused { remaining } => {
                write!(f, "PAUSED ({} ms remaining)", remaining.as_millis())
            }
            TimerState::Resumed => f.write_str("RESUMED"),
            TimerState::Cancelled => f.write_str("CANCELLED"),
            TimerState::Deleted => f.write_str("DELETED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF: Duration = Duration::from_millis(500);

    #[test]
    fn follows_the_pause_resume_cycle() {
        let state = TimerState::Init.transition(Trigger::Start).unwrap();
        assert_eq!(state, TimerState::Running);

        let state = state.transition(Trigger::Pause { remaining: HALF }).unwrap();
        assert_eq!(state, TimerState::Paused { remaining: HALF });
        assert_eq!(state.remaining(), HALF);
        assert!(!state.is_armed());

        let state = state.transition(Trigger::Resume).unwrap();
        assert_eq!(state, TimerState::Resumed);
        assert_eq!(state.remaining(), Duration::ZERO);
        assert!(state.is_armed());

        let state = state.transition(Trigger::Expire).unwrap();
        assert_eq!(state, TimerState::Running);
    }

    #[test]
    fn resume_requires_paused() {
        for state in [
            TimerState::Init,
            TimerState::Running,
            TimerState::Resumed,
            TimerState::Cancelled,
            TimerState::Deleted,
        ] {
            assert_eq!(
                state.transition(Trigger::Resume),
                Err(TimerError::InvalidStateTransition {
                    from: state,
                    trigger: "resume"
                })
            );
        }
    }

    #[test]
    fn pause_requires_running() {
        let pause = Trigger::Pause { remaining: HALF };
        assert!(TimerState::Init.transition(pause).is_err());
        assert!(TimerState::Resumed.transition(pause).is_err());
        assert!(TimerState::Paused { remaining: HALF }.transition(pause).is_err());
    }

    #[test]
    fn cancel_from_any_live_state() {
        for state in [
            TimerState::Init,
            TimerState::Running,
            TimerState::Paused { remaining: HALF },
            TimerState::Resumed,
        ] {
            assert_eq!(state.transition(Trigger::Cancel), Ok(TimerState::Cancelled));
        }
        assert!(TimerState::Cancelled.transition(Trigger::Cancel).is_err());
        assert!(TimerState::Deleted.transition(Trigger::Cancel).is_err());
    }

    #[test]
    fn delete_is_final() {
        assert_eq!(
            TimerState::Cancelled.transition(Trigger::Delete),
            Ok(TimerState::Deleted)
        );
        for trigger in [Trigger::Start, Trigger::Resume, Trigger::Expire, Trigger::Delete] {
            assert!(TimerState::Deleted.transition(trigger).is_err());
        }
    }

    #[test]
    fn cancelled_timer_can_be_restarted() {
        assert_eq!(
            TimerState::Cancelled.transition(Trigger::Start),
            Ok(TimerState::Running)
        );
        assert!(TimerState::Running.transition(Trigger::Start).is_err());
    }

    #[test]
    fn expirations_only_land_on_armed_states() {
        assert!(TimerState::Init.transition(Trigger::Expire).is_err());
        assert!(TimerState::Paused { remaining: HALF }
            .transition(Trigger::Expire)
            .is_err());
        assert_eq!(
            TimerState::Resumed.transition(Trigger::Exhaust),
            Ok(TimerState::Cancelled)
        );
    }

    #[test]
    fn late_expiration_can_exhaust_a_paused_timer() {
        assert_eq!(
            TimerState::Paused { remaining: HALF }.transition(Trigger::Exhaust),
            Ok(TimerState::Cancelled)
        );
        assert!(TimerState::Cancelled.transition(Trigger::Exhaust).is_err());
    }

    #[test]
    fn displays_state_names() {
        assert_eq!(TimerState::Running.to_string(), "RUNNING");
        assert_eq!(
            TimerState::Paused { remaining: HALF }.to_string(),
            "PAUSED (500 ms remaining)"
        );
    }
}
