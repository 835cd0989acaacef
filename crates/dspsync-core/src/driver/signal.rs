//! Completion signal raised by the coprocessor at the end of every frame
//!
//! Built on a one-slot crossbeam channel: raising fills the slot (a second
//! raise before the wait coalesces), waiting takes it, and closing drops the
//! sender so every wait after that sees a disconnected channel.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::DriverError;

/// Auto-clearing event the driver raises from its interrupt path
///
/// Once closed, every current and future wait fails with
/// [`DriverError::SignalClosed`].
#[derive(Debug)]
pub struct CompletionSignal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx: Mutex::new(Some(tx)), rx }
    }

    /// Mark the signal as fired and wake the waiter
    pub fn raise(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    log::debug!("CompletionSignal: Raised with no receiver left")
                }
            }
        }
    }

    /// Tear the signal down; waiters return `SignalClosed`
    pub fn close(&self) {
        let dropped = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(dropped);
        // A raise still sitting in the slot must not outlive the close
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Wait until raised, clearing it on success
    ///
    /// `None` waits forever. Returns `Ok(false)` if the timeout elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, DriverError> {
        let received = match timeout {
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(timeout) => self.rx.recv_timeout(timeout),
        };
        match received {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::SignalClosed),
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_clears_after_raise() {
        let signal = CompletionSignal::new();
        signal.raise();
        assert_eq!(signal.wait(Some(Duration::from_millis(1))), Ok(true));
        assert_eq!(signal.wait(Some(Duration::from_millis(1))), Ok(false));
    }

    #[test]
    fn test_repeated_raises_coalesce() {
        let signal = CompletionSignal::new();
        signal.raise();
        signal.raise();
        signal.raise();
        assert_eq!(signal.wait(Some(Duration::ZERO)), Ok(true));
        assert_eq!(signal.wait(Some(Duration::from_millis(1))), Ok(false));
    }

    #[test]
    fn test_raise_from_other_thread() {
        let signal = Arc::new(CompletionSignal::new());
        let raiser = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            raiser.raise();
        });
        assert_eq!(signal.wait(None), Ok(true));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_wakes_blocked_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let closer = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            closer.close();
        });
        assert_eq!(signal.wait(None), Err(DriverError::SignalClosed));
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_signal_rejects_waits() {
        let signal = CompletionSignal::new();
        signal.raise();
        signal.close();
        assert_eq!(signal.wait(None), Err(DriverError::SignalClosed));
        signal.raise();
        assert!(signal.is_closed());
        assert_eq!(signal.wait(Some(Duration::ZERO)), Err(DriverError::SignalClosed));
    }
}
