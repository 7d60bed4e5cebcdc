use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A stop flag that background loops can sleep on.
///
/// Cloning yields another handle to the same flag. Once triggered it stays triggered, so each
/// session gets a fresh signal rather than resetting an old one.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleeps for up to `timeout`, waking early if the signal is triggered.
    ///
    /// Returns true when the signal was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            // Effectively forever
            while !*stopped {
                self.inner.cvar.wait(&mut stopped);
            }
            return true;
        };

        while !*stopped {
            if self.inner.cvar.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }

        *stopped
    }
}

/// Joins `handle` if the thread finishes within `timeout`.
///
/// Returns false if the thread was still running at the deadline; the thread is then left
/// detached.
pub(crate) fn join_within(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    // A panicking thread has already been reported by its own loop boundary
    let _ = handle.join();
    true
}
