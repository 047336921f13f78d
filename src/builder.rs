//! Fluent timer configuration.

use std::sync::Arc;

#[cfg(feature = "logging")]
use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::{CallbackFailure, TimerError};
use crate::scheduler::Scheduler;
use crate::timer::{Settings, Timer, TimerCallback};

/// Collects the configuration of a [`Timer`] before allocating it.
///
/// ```no_run
/// use pausable_timer::{Timer, TokioScheduler};
///
/// # async fn demo() -> Result<(), pausable_timer::TimerError> {
/// let scheduler = TokioScheduler::new();
/// let timer = Timer::builder()
///     .callback_fn(|timer, _| println!("fired #{}", timer.invocation_count()))
///     .initial_delay_ms(1_000)
///     .interval_ms(1_000)
///     .threshold(5)
///     .setup(&scheduler)?;
/// timer.start()?;
/// # Ok(())
/// # }
/// ```
pub struct TimerBuilder<C: Send + Sync + 'static = ()> {
    callback: Option<Box<dyn TimerCallback<C>>>,
    context: Arc<C>,
    initial_delay_ms: u64,
    interval_ms: u64,
    threshold: u32,
    exponential_backoff: bool,
    failures: Option<UnboundedSender<CallbackFailure>>,
}

impl TimerBuilder<()> {
    pub fn new() -> Self {
        Self::with_context(Arc::new(()))
    }
}

impl Default for TimerBuilder<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + Sync + 'static> TimerBuilder<C> {
    /// Starts a configuration whose callback receives `context`. The caller
    /// may keep its own clone of the `Arc`.
    pub fn with_context(context: Arc<C>) -> Self {
        TimerBuilder {
            callback: None,
            context,
            initial_delay_ms: 0,
            interval_ms: 0,
            threshold: 0,
            exponential_backoff: false,
            failures: None,
        }
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: TimerCallback<C> + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Same as [`callback`](Self::callback) for a plain closure, letting the
    /// compiler infer its argument types.
    pub fn callback_fn<F>(self, callback: F) -> Self
    where
        F: Fn(&Timer<C>, &C) + Send + Sync + 'static,
    {
        self.callback(callback)
    }

    /// Delay before the first expiration. Must be non-zero.
    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    /// Delay between later expirations; zero (the default) means one-shot.
    pub fn interval_ms(mut self, ms: u64) -> Self {
        self.interval_ms = ms;
        self
    }

    /// Maximum number of invocations; zero (the default) means unbounded.
    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Recorded on the timer but not applied yet.
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    /// Channel receiving a [`CallbackFailure`] for every callback run that
    /// returns an error or panics.
    pub fn failure_channel(mut self, failures: UnboundedSender<CallbackFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Allocates a scheduler resource and returns the timer, not yet armed.
    pub fn setup(self, scheduler: &dyn Scheduler) -> Result<Timer<C>, TimerError> {
        let callback = self.callback.ok_or(TimerError::NullCallback)?;
        if self.initial_delay_ms == 0 {
            return Err(TimerError::InvalidParameter(
                "Initial delay must be greater than zero.".into(),
            ));
        }

        let engine = scheduler.create()?;

        #[cfg(feature = "logging")]
        debug!(
            "Timer set up: delay {} ms, interval {} ms, threshold {}.",
            self.initial_delay_ms, self.interval_ms, self.threshold
        );

        Ok(Timer::from_parts(
            engine,
            callback,
            self.context,
            Settings {
                initial_delay_ms: self.initial_delay_ms,
                interval_ms: self.interval_ms,
                threshold: self.threshold,
                exponential_backoff: self.exponential_backoff,
            },
            self.failures,
        ))
    }
}
