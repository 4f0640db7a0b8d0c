//! Step and session cancellation plumbing.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One-shot completion signal. `wait_for` returns false on timeout.
#[derive(Debug, Default)]
pub struct Notification {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut notified = self.notified.lock().expect("notification poisoned");
        *notified = true;
        self.cv.notify_all();
    }

    pub fn has_been_notified(&self) -> bool {
        *self.notified.lock().expect("notification poisoned")
    }

    pub fn wait(&self) {
        let mut notified = self.notified.lock().expect("notification poisoned");
        while !*notified {
            notified = self.cv.wait(notified).expect("notification poisoned");
        }
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut notified = self.notified.lock().expect("notification poisoned");
        while !*notified {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .cv
                .wait_timeout(notified, deadline - now)
                .expect("notification poisoned");
            notified = guard;
            if result.timed_out() && !*notified {
                return false;
            }
        }
        true
    }
}

pub type CancelCallback = Box<dyn FnOnce() + Send>;
pub type CancellationToken = u64;

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    next_token: CancellationToken,
    callbacks: HashMap<CancellationToken, CancelCallback>,
}

/// Fans cancellation out to registered callbacks. Each step owns a fresh
/// manager; the session's manager cancels every registered step on `Close`.
#[derive(Default)]
pub struct CancellationManager {
    state: Mutex<CancelState>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cancellation_token(&self) -> CancellationToken {
        let mut state = self.state.lock().expect("cancellation state poisoned");
        let token = state.next_token;
        state.next_token += 1;
        token
    }

    /// Returns false (dropping the callback) when cancellation has already
    /// started.
    pub fn register_callback(&self, token: CancellationToken, callback: CancelCallback) -> bool {
        let mut state = self.state.lock().expect("cancellation state poisoned");
        if state.cancelled {
            return false;
        }
        state.callbacks.insert(token, callback);
        true
    }

    /// Returns false when cancellation already started (the callback has run
    /// or is running).
    pub fn deregister_callback(&self, token: CancellationToken) -> bool {
        let mut state = self.state.lock().expect("cancellation state poisoned");
        if state.cancelled {
            return false;
        }
        state.callbacks.remove(&token);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .expect("cancellation state poisoned")
            .cancelled
    }

    /// Idempotent. Callbacks run outside the lock.
    pub fn start_cancel(&self) {
        let callbacks = {
            let mut state = self.state.lock().expect("cancellation state poisoned");
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancel_runs_registered_callbacks_once() {
        let manager = CancellationManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let token = manager.get_cancellation_token();
        let fired_clone = Arc::clone(&fired);
        assert!(manager.register_callback(
            token,
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
        ));
        manager.start_cancel();
        manager.start_cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!manager.deregister_callback(token));
    }

    #[test]
    fn register_after_cancel_reports_failure() {
        let manager = CancellationManager::new();
        manager.start_cancel();
        let token = manager.get_cancellation_token();
        assert!(!manager.register_callback(token, Box::new(|| {})));
    }

    #[test]
    fn notification_timeout() {
        let note = Notification::new();
        assert!(!note.wait_for(Duration::from_millis(10)));
        note.notify();
        assert!(note.wait_for(Duration::from_millis(10)));
        assert!(note.has_been_notified());
    }
}
