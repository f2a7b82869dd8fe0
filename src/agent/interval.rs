//! Heartbeat interval ownership.
//!
//! The [`IntervalController`] is the single source of truth for the tick
//! interval. Every writer (local control, remote settings sync) goes through
//! [`IntervalController::set`]; the last writer wins.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::ValidationError;

/// Smallest permitted heartbeat interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Largest permitted heartbeat interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Interval used when nothing else is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

type Listener = Arc<dyn Fn(Duration) + Send + Sync>;

/// Owns the permitted tick interval and broadcasts changes.
pub struct IntervalController {
    tx: watch::Sender<Duration>,
    listeners: RwLock<Vec<Listener>>,
}

impl IntervalController {
    /// Create a controller with an initial interval.
    pub fn new(initial: Duration) -> Result<Self, ValidationError> {
        validate(initial)?;
        let (tx, _rx) = watch::channel(initial);
        Ok(Self {
            tx,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Current interval.
    pub fn get(&self) -> Duration {
        *self.tx.borrow()
    }

    /// Replace the interval.
    ///
    /// Values outside [`MIN_INTERVAL`]..=[`MAX_INTERVAL`] are rejected and the
    /// current value is kept. Subscribers are notified before this returns.
    pub fn set(&self, value: Duration) -> Result<(), ValidationError> {
        validate(value)?;

        let previous = self.tx.send_replace(value);

        // Clone out so a listener may call back into the controller.
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in &listeners {
            listener(value);
        }

        tracing::info!(
            previous_secs = previous.as_secs(),
            interval_secs = value.as_secs(),
            "Heartbeat interval updated"
        );
        Ok(())
    }

    /// Replace the interval from a whole number of seconds.
    pub fn set_secs(&self, secs: u64) -> Result<(), ValidationError> {
        self.set(Duration::from_secs(secs))
    }

    /// Receiver that observes every accepted change.
    pub fn subscribe(&self) -> watch::Receiver<Duration> {
        self.tx.subscribe()
    }

    /// Register a callback invoked synchronously on every accepted change.
    pub fn on_change(&self, listener: impl Fn(Duration) + Send + Sync + 'static) {
        let listener: Listener = Arc::new(listener);
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }
}

impl Default for IntervalController {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(DEFAULT_INTERVAL);
        Self {
            tx,
            listeners: RwLock::new(Vec::new()),
        }
    }
}

fn validate(value: Duration) -> Result<(), ValidationError> {
    if value < MIN_INTERVAL || value > MAX_INTERVAL {
        return Err(ValidationError::IntervalOutOfRange {
            secs: value.as_secs(),
            min: MIN_INTERVAL.as_secs(),
            max: MAX_INTERVAL.as_secs(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[test]
    fn test_accepts_every_value_in_range() {
        let controller = IntervalController::default();
        for secs in 5..=300 {
            controller.set_secs(secs).unwrap();
            assert_eq!(controller.get(), Duration::from_secs(secs));
        }
    }

    #[test]
    fn test_rejects_out_of_range_and_keeps_previous() {
        let controller = IntervalController::default();
        controller.set_secs(45).unwrap();

        for secs in [0, 1, 4, 301, 3600] {
            let err = controller.set_secs(secs).unwrap_err();
            assert_eq!(
                err,
                ValidationError::IntervalOutOfRange {
                    secs,
                    min: 5,
                    max: 300
                }
            );
            assert_eq!(controller.get(), Duration::from_secs(45));
        }
    }

    #[test]
    fn test_sub_second_below_minimum_is_rejected() {
        let controller = IntervalController::default();
        assert!(controller.set(Duration::from_millis(4_999)).is_err());
        assert_eq!(controller.get(), DEFAULT_INTERVAL);
    }

    #[test]
    fn test_new_validates_initial_value() {
        assert!(IntervalController::new(Duration::from_secs(2)).is_err());
        let controller = IntervalController::new(Duration::from_secs(60)).unwrap();
        assert_eq!(controller.get(), Duration::from_secs(60));
    }

    #[test]
    fn test_listeners_notified_before_set_returns() {
        let controller = IntervalController::default();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        controller.on_change(move |d| seen_clone.store(d.as_secs(), Ordering::SeqCst));

        controller.set_secs(120).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 120);

        // Rejected values never reach listeners.
        let _ = controller.set_secs(900);
        assert_eq!(seen.load(Ordering::SeqCst), 120);
    }

    #[test]
    fn test_subscriber_sees_latest_value() {
        let controller = IntervalController::default();
        let mut rx = controller.subscribe();
        controller.set_secs(10).unwrap();
        controller.set_secs(20).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Duration::from_secs(20));
    }
}
