//! # pausable-timer
//! One-shot and periodic timers that can be paused and resumed with
//! sub-interval precision, deliver a callback on every expiration and stop on
//! their own after an optional number of invocations.

pub mod builder;
pub mod errors;
pub mod interval;
pub mod manager;
pub mod manual;
pub mod scheduler;
pub mod state;
pub mod timer;

pub use builder::TimerBuilder;
pub use errors::{CallbackFailure, FailureKind, TimerError};
pub use interval::{from_interval, to_interval, IntervalValue, TimerSpec};
pub use manager::TimerManager;
pub use manual::ManualScheduler;
pub use scheduler::{Expiry, Scheduler, TimerEngine, TokioScheduler};
pub use state::{TimerState, Trigger};
pub use timer::{Timer, TimerCallback, TimerStatistics};
