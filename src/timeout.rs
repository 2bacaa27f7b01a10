//! Timeout guard.
//!
//! [`TimeoutGuard::arm`] races a pending result against a deadline on the
//! loop. Whichever finishes first stops the loop; the other side is defused.
//! Completion wins ties: within a tick, task polls run before due timers, and
//! a cancelled deadline callback never fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::config::Deadline;
use crate::event_loop::TimeoutHandle;
use crate::pending::PendingResult;
use crate::runtime::EventLoop;

#[derive(Debug, Default)]
struct GuardState {
    finished: AtomicBool,
    timed_out: AtomicBool,
    timer: Mutex<Option<TimeoutHandle>>,
}

impl GuardState {
    /// Claims the right to end the race. Only the first caller wins.
    fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }
}

/// Stops the loop when a pending result settles or its deadline fires.
///
/// Dropping the guard disarms it.
#[derive(Debug)]
pub struct TimeoutGuard<L: EventLoop> {
    io_loop: L,
    deadline: Deadline,
    state: Arc<GuardState>,
}

impl<L: EventLoop> TimeoutGuard<L> {
    /// Arms the guard for `pending` on `io_loop`.
    ///
    /// The deadline is measured from now. Expiry stops the loop and marks
    /// the guard as expired; settlement cancels the deadline callback and
    /// stops the loop. A handle that is already settled stops the loop on
    /// its first tick.
    pub fn arm<T>(io_loop: &L, pending: &PendingResult<T>, deadline: Deadline) -> Self {
        let state = Arc::new(GuardState::default());

        if let Deadline::After(timeout) = deadline {
            let expiry_state = Arc::clone(&state);
            let expiry_loop = io_loop.clone();
            let handle = io_loop.call_later(timeout, move || {
                if !expiry_state.finish() {
                    return;
                }
                expiry_state.timed_out.store(true, Ordering::SeqCst);
                warn!(?timeout, "deadline exceeded, stopping loop");
                if let Err(err) = expiry_loop.stop() {
                    warn!(error = %err, "failed to stop loop on deadline");
                }
            });
            *state.timer.lock() = Some(handle);
        }

        let settle_state = Arc::clone(&state);
        let settle_loop = io_loop.clone();
        pending.on_settled(move || {
            if !settle_state.finish() {
                return;
            }
            if let Some(handle) = settle_state.timer.lock().take() {
                settle_loop.remove_timeout(handle);
            }
            trace!("pending result settled, stopping loop");
            // May run on another thread, or before the loop has started;
            // the stop is issued from the loop itself.
            let stopper = settle_loop.clone();
            settle_loop.add_callback(move || {
                if let Err(err) = stopper.stop() {
                    warn!(error = %err, "failed to stop loop on completion");
                }
            });
        });

        Self {
            io_loop: io_loop.clone(),
            deadline,
            state,
        }
    }

    /// The configured deadline.
    #[must_use]
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Returns true once either side has won the race.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// The timeout, if the deadline fired before the result settled.
    #[must_use]
    pub fn expired(&self) -> Option<Duration> {
        if self.state.timed_out.load(Ordering::SeqCst) {
            self.deadline.duration()
        } else {
            None
        }
    }

    /// Defuses both sides and cancels the deadline callback.
    pub fn disarm(&self) {
        self.state.finished.store(true, Ordering::SeqCst);
        if let Some(handle) = self.state.timer.lock().take() {
            self.io_loop.remove_timeout(handle);
        }
    }
}

impl<L: EventLoop> Drop for TimeoutGuard<L> {
    fn drop(&mut self) {
        self.disarm();
    }
}
