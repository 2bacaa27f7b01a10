//! Timer queue for scheduled callbacks.

use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::event_loop::RunId;
use crate::pending::Callback;

/// Handle returned when a callback is scheduled; used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeoutHandle(u64);

/// A scheduled deadline in the heap.
#[derive(Debug)]
struct TimerEntry {
    /// When the timer becomes due, relative to the loop's origin
    deadline: Duration,
    /// Registration order, breaks ties between equal deadlines
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse order for min-heap behavior (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Scheduled {
    run: Option<RunId>,
    callback: Callback,
}

/// Pending timers, earliest deadline first.
///
/// Cancelling only forgets the callback; the heap entry goes stale and is
/// skipped when it surfaces.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    live: HashMap<u64, Scheduled>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedules `callback` to become due at `deadline`.
    pub(crate) fn insert(
        &mut self,
        deadline: Duration,
        run: Option<RunId>,
        callback: Callback,
    ) -> TimeoutHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(TimerEntry { deadline, id });
        self.live.insert(id, Scheduled { run, callback });
        TimeoutHandle(id)
    }

    /// Cancels a timer. Returns `false` if it already fired or was cancelled.
    pub(crate) fn cancel(&mut self, handle: TimeoutHandle) -> bool {
        self.live.remove(&handle.0).is_some()
    }

    /// Pops every live timer due at `now`, in firing order.
    ///
    /// The callbacks stay registered until [`take`](Self::take)n, so a timer
    /// cancelled after this call still never fires.
    pub(crate) fn due(&mut self, now: Duration) -> Vec<TimeoutHandle> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                if self.live.contains_key(&entry.id) {
                    due.push(TimeoutHandle(entry.id));
                }
            }
        }
        due
    }

    /// Removes and returns the callback for a due timer.
    pub(crate) fn take(&mut self, handle: TimeoutHandle) -> Option<Callback> {
        self.live.remove(&handle.0).map(|scheduled| scheduled.callback)
    }

    /// The earliest live deadline, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(entry) = self.heap.peek() {
            if self.live.contains_key(&entry.id) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes every timer registered during `run`, returning their callbacks.
    pub(crate) fn discard_run(&mut self, run: RunId) -> Vec<Callback> {
        let ids: Vec<u64> = self
            .live
            .iter()
            .filter(|(_, scheduled)| scheduled.run == Some(run))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.live.remove(&id))
            .map(|scheduled| scheduled.callback)
            .collect()
    }

    /// Removes every timer, returning their callbacks.
    pub(crate) fn clear(&mut self) -> Vec<Callback> {
        self.heap.clear();
        self.live.drain().map(|(_, scheduled)| scheduled.callback).collect()
    }

    /// Number of timers that can still fire.
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("live", &self.live.len())
            .field("heap", &self.heap.len())
            .finish()
    }
}
