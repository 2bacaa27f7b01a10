//! The `IoLoop` implementation.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Wake, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::Deadline;
use crate::error::{LoopMisuse, Result};
use crate::event_loop::task::{Task, TaskId};
use crate::event_loop::timer::{TimeoutHandle, TimerQueue};
use crate::event_loop::RunId;
use crate::pending::{pending, Callback, PendingResult};
use crate::runtime::EventLoop;

thread_local! {
    static CURRENT: RefCell<Option<IoLoop>> = RefCell::new(None);
}

/// A single-threaded cooperative event loop.
///
/// `start` runs the loop on the calling thread until `stop` is requested.
/// Each tick first runs the callbacks and task polls that were queued before
/// the tick, in FIFO order, then fires due timers in deadline order. When
/// there is nothing to do the loop sleeps until the next timer is due or
/// something wakes it.
///
/// Handles are cheap to clone and every method may be called from any
/// thread; only `start` blocks.
///
/// # Example
///
/// ```rust
/// use gentest::IoLoop;
/// use std::time::Duration;
///
/// let io_loop = IoLoop::new();
/// let stopper = io_loop.clone();
/// io_loop.call_later(Duration::from_millis(5), move || {
///     stopper.stop().unwrap();
/// });
///
/// io_loop.start().unwrap();
/// assert!(!io_loop.is_running());
/// ```
#[derive(Clone)]
pub struct IoLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    /// Work queued for the next tick.
    ready: Mutex<VecDeque<Runnable>>,
    /// Signalled whenever work is queued or a stop is requested.
    wakeup: Condvar,
    timers: Mutex<TimerQueue>,
    /// Tasks that are not currently being polled.
    tasks: Mutex<HashMap<TaskId, Task>>,
    status: Mutex<Status>,
    stop_requested: AtomicBool,
    /// The run that currently owns the loop, or zero.
    active_run: AtomicU64,
    next_run: AtomicU64,
    origin: Instant,
    #[cfg(feature = "tokio")]
    tokio: Option<::tokio::runtime::Handle>,
}

enum Runnable {
    Callback {
        run: Option<RunId>,
        callback: Callback,
    },
    Poll(TaskId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Idle,
    Running,
    Stopping,
    Closed,
}

/// Builder for [`IoLoop`].
#[derive(Debug, Default)]
pub struct IoLoopBuilder {
    #[cfg(feature = "tokio")]
    tokio: Option<::tokio::runtime::Handle>,
}

impl IoLoopBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the given tokio runtime's context while the loop runs, so
    /// tokio timers and I/O can be awaited from loop tasks.
    #[cfg(feature = "tokio")]
    #[must_use]
    pub fn tokio(mut self, handle: ::tokio::runtime::Handle) -> Self {
        self.tokio = Some(handle);
        self
    }

    /// Builds the loop.
    #[must_use]
    pub fn build(self) -> IoLoop {
        IoLoop {
            inner: Arc::new(LoopInner {
                ready: Mutex::new(VecDeque::new()),
                wakeup: Condvar::new(),
                timers: Mutex::new(TimerQueue::new()),
                tasks: Mutex::new(HashMap::new()),
                status: Mutex::new(Status::Idle),
                stop_requested: AtomicBool::new(false),
                active_run: AtomicU64::new(0),
                next_run: AtomicU64::new(0),
                origin: Instant::now(),
                #[cfg(feature = "tokio")]
                tokio: self.tokio,
            }),
        }
    }
}

impl IoLoop {
    /// Creates a new idle loop.
    ///
    /// # Example
    ///
    /// ```rust
    /// use gentest::IoLoop;
    ///
    /// let io_loop = IoLoop::new();
    /// assert!(!io_loop.is_running());
    /// assert_eq!(io_loop.pending_callbacks(), 0);
    /// ```
    #[must_use]
    pub fn new() -> Self {
        IoLoopBuilder::new().build()
    }

    /// Returns a builder for a customised loop.
    #[must_use]
    pub fn builder() -> IoLoopBuilder {
        IoLoopBuilder::new()
    }

    /// Returns the loop that is current on this thread, if any.
    ///
    /// A running loop is always current on the thread running it.
    #[must_use]
    pub fn current() -> Option<IoLoop> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Makes this loop current on this thread until the guard is dropped.
    #[must_use = "the loop stops being current when the guard is dropped"]
    pub fn make_current(&self) -> CurrentGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(self.clone()));
        CurrentGuard { previous }
    }

    /// Runs the loop on this thread until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`LoopMisuse::AlreadyRunning`] if the loop is running and
    /// [`LoopMisuse::Closed`] after [`close`](Self::close).
    pub fn start(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                Status::Idle => *status = Status::Running,
                Status::Running | Status::Stopping => {
                    return Err(LoopMisuse::AlreadyRunning.into())
                }
                Status::Closed => return Err(LoopMisuse::Closed.into()),
            }
        }

        let _running = RunningGuard { inner: &self.inner };
        let _current = self.make_current();
        #[cfg(feature = "tokio")]
        let _context = self.inner.tokio.as_ref().map(::tokio::runtime::Handle::enter);

        debug!("event loop started");
        let mut ticks: u64 = 0;
        loop {
            let worked = self.run_once();
            ticks += 1;
            if self.inner.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if !worked {
                self.wait_for_work();
            }
        }
        debug!(ticks, "event loop stopped");
        Ok(())
    }

    /// Asks the running loop to return from `start` after the current tick.
    ///
    /// # Errors
    ///
    /// Returns [`LoopMisuse::NotRunning`] if the loop is idle,
    /// [`LoopMisuse::AlreadyStopping`] if a stop is already pending and
    /// [`LoopMisuse::Closed`] after [`close`](Self::close).
    pub fn stop(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                Status::Running => *status = Status::Stopping,
                Status::Stopping => return Err(LoopMisuse::AlreadyStopping.into()),
                Status::Idle => return Err(LoopMisuse::NotRunning.into()),
                Status::Closed => return Err(LoopMisuse::Closed.into()),
            }
        }
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.notify();
        Ok(())
    }

    /// Returns true between `start` and the moment it returns.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.inner.status.lock(), Status::Running | Status::Stopping)
    }

    /// Returns true once the loop has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.status.lock() == Status::Closed
    }

    /// Closes the loop, dropping every queued callback, timer and task.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LoopMisuse::AlreadyRunning`] if the loop is running.
    pub fn close(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                Status::Running | Status::Stopping => {
                    return Err(LoopMisuse::AlreadyRunning.into())
                }
                Status::Closed => return Ok(()),
                Status::Idle => *status = Status::Closed,
            }
        }

        // Dropped outside the locks: futures may touch the loop when dropped.
        let ready: Vec<Runnable> = self.inner.ready.lock().drain(..).collect();
        let timers = self.inner.timers.lock().clear();
        let tasks: Vec<Task> = self.inner.tasks.lock().drain().map(|(_, t)| t).collect();
        debug!(
            callbacks = ready.len(),
            timers = timers.len(),
            tasks = tasks.len(),
            "event loop closed"
        );
        drop((ready, timers, tasks));
        Ok(())
    }

    /// Time elapsed since the loop was created.
    #[must_use]
    pub fn time(&self) -> Duration {
        self.inner.origin.elapsed()
    }

    /// Runs `callback` on the next tick.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let run = self.active_run();
        let mut ready = self.inner.ready.lock();
        ready.push_back(Runnable::Callback {
            run,
            callback: Box::new(callback),
        });
        self.inner.wakeup.notify_all();
    }

    /// Runs `callback` once `delay` has elapsed.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        // Saturates: a deadline at `Duration::MAX` is never due.
        self.call_at(self.time().saturating_add(delay), callback)
    }

    /// Runs `callback` once the loop's [`time`](Self::time) reaches `when`.
    pub fn call_at<F>(&self, when: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let run = self.active_run();
        let handle = self
            .inner
            .timers
            .lock()
            .insert(when, run, Box::new(callback));
        // The new deadline may be earlier than the one the loop sleeps on.
        self.notify();
        handle
    }

    /// Cancels a scheduled callback.
    ///
    /// Returns `false` if it already fired or was cancelled. A cancelled
    /// callback never runs, even if it was due in the current tick.
    pub fn remove_timeout(&self, handle: TimeoutHandle) -> bool {
        self.inner.timers.lock().cancel(handle)
    }

    /// Spawns a future as a loop task.
    ///
    /// When called on the thread running the loop, or while the loop is
    /// idle, the future runs immediately until it first suspends. Otherwise
    /// its first poll is queued for the loop thread. From then on the loop
    /// polls it whenever it is woken. A panic inside the future settles the
    /// returned handle as raised.
    ///
    /// # Example
    ///
    /// ```rust
    /// use gentest::IoLoop;
    ///
    /// let io_loop = IoLoop::new();
    /// let handle = io_loop.spawn(async { 6 * 7 });
    /// assert!(handle.is_settled());
    /// ```
    pub fn spawn<F>(&self, future: F) -> PendingResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (resolver, handle) = pending();
        let task = Task::new(future, resolver, self.active_run());
        let id = task.id;
        trace!(task = %id, "spawned task");
        self.inner.tasks.lock().insert(id, task);
        if self.polls_here() {
            self.poll_task(id);
        } else {
            self.schedule_poll(id);
        }
        handle
    }

    /// A pending operation that resolves after `delay`.
    #[must_use]
    pub fn sleep(&self, delay: Duration) -> PendingResult<()> {
        let (resolver, handle) = pending();
        self.call_later(delay, move || resolver.resolve(()));
        handle
    }

    /// A pending operation that resolves on the next tick.
    #[must_use]
    pub fn next_tick(&self) -> PendingResult<()> {
        let (resolver, handle) = pending();
        self.add_callback(move || resolver.resolve(()));
        handle
    }

    /// Drives `future` to completion on this loop.
    ///
    /// # Errors
    ///
    /// Returns a [`LoopMisuse`] error if the loop cannot be started, or is
    /// stopped by someone else before `future` completes.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from inside `future`.
    pub fn run_until<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.run_sync(Deadline::Never, future)
    }

    /// Drives `future` to completion on this loop, giving up at `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`](crate::Error::DeadlineExceeded)
    /// if the deadline fires first, and a [`LoopMisuse`] error if the loop
    /// cannot be driven.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from inside `future`.
    pub fn run_sync<F>(&self, deadline: Deadline, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        EventLoop::run_sync(self, deadline, future)
    }

    /// Number of callbacks and task polls waiting for the next tick.
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.inner.ready.lock().len()
    }

    /// Number of timers that can still fire.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Number of unfinished tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Claims the loop for one driver run.
    pub(crate) fn begin_run(&self) -> Result<RunId> {
        match *self.inner.status.lock() {
            Status::Idle => {}
            Status::Running | Status::Stopping => return Err(LoopMisuse::AlreadyRunning.into()),
            Status::Closed => return Err(LoopMisuse::Closed.into()),
        }
        let raw = self.inner.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .active_run
            .compare_exchange(0, raw, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| LoopMisuse::AlreadyRunning)?;
        Ok(RunId::new(raw))
    }

    /// Releases the loop and discards whatever `run` left behind.
    ///
    /// Returns the number of callbacks, timers and tasks discarded.
    pub(crate) fn end_run(&self, run: RunId) -> usize {
        let _ = self.inner.active_run.compare_exchange(
            run.as_u64(),
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        let callbacks: Vec<Runnable> = {
            let mut ready = self.inner.ready.lock();
            let (discarded, kept): (Vec<_>, Vec<_>) = ready.drain(..).partition(|runnable| {
                matches!(runnable, Runnable::Callback { run: Some(r), .. } if *r == run)
            });
            ready.extend(kept);
            discarded
        };
        let timers = self.inner.timers.lock().discard_run(run);
        let tasks: Vec<Task> = {
            let mut tasks = self.inner.tasks.lock();
            let ids: Vec<TaskId> = tasks
                .values()
                .filter(|task| task.run == Some(run))
                .map(|task| task.id)
                .collect();
            ids.iter().filter_map(|id| tasks.remove(id)).collect()
        };

        let discarded = callbacks.len() + timers.len() + tasks.len();
        if discarded > 0 {
            debug!(
                %run,
                callbacks = callbacks.len(),
                timers = timers.len(),
                tasks = tasks.len(),
                "discarded work left over from run"
            );
        }
        drop((callbacks, timers, tasks));
        discarded
    }

    fn active_run(&self) -> Option<RunId> {
        match self.inner.active_run.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(RunId::new(raw)),
        }
    }

    /// Runs one tick. Returns `false` if there was nothing to do.
    fn run_once(&self) -> bool {
        let batch: Vec<Runnable> = self.inner.ready.lock().drain(..).collect();
        let due = self.inner.timers.lock().due(self.time());
        if batch.is_empty() && due.is_empty() {
            return false;
        }
        trace!(ready = batch.len(), due = due.len(), "tick");

        for runnable in batch {
            match runnable {
                Runnable::Callback { callback, .. } => callback(),
                Runnable::Poll(id) => self.poll_task(id),
            }
        }
        for handle in due {
            // Looked up one at a time: an earlier callback may cancel a later one.
            let callback = self.inner.timers.lock().take(handle);
            if let Some(callback) = callback {
                callback();
            }
        }
        true
    }

    /// Sleeps until work is queued, the next timer is due, or a stop is requested.
    fn wait_for_work(&self) {
        let mut ready = self.inner.ready.lock();
        if !ready.is_empty() || self.inner.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        let next = self.inner.timers.lock().next_deadline();
        match next {
            Some(deadline) => {
                let now = self.time();
                if deadline > now {
                    let _ = self.inner.wakeup.wait_for(&mut ready, deadline - now);
                }
            }
            None => self.inner.wakeup.wait(&mut ready),
        }
    }

    fn notify(&self) {
        let _ready = self.inner.ready.lock();
        self.inner.wakeup.notify_all();
    }

    /// Whether a task may be polled on the calling thread right now.
    fn polls_here(&self) -> bool {
        if *self.inner.status.lock() == Status::Idle {
            return true;
        }
        CURRENT.with(|current| current.borrow().as_ref() == Some(self))
    }

    fn schedule_poll(&self, id: TaskId) {
        let mut ready = self.inner.ready.lock();
        ready.push_back(Runnable::Poll(id));
        self.inner.wakeup.notify_all();
    }

    /// Polls a task once, if it still exists.
    fn poll_task(&self, id: TaskId) {
        let task = self.inner.tasks.lock().remove(&id);
        // Already finished, or discarded along with its run.
        let Some(mut task) = task else {
            return;
        };
        task.woken.store(false, Ordering::SeqCst);

        let waker = Waker::from(Arc::new(TaskWaker {
            inner: Arc::downgrade(&self.inner),
            id,
            woken: Arc::clone(&task.woken),
        }));
        let mut cx = Context::from_waker(&waker);

        // Spawn polls eagerly, possibly before `start` has entered the context.
        #[cfg(feature = "tokio")]
        let _context = self.inner.tokio.as_ref().map(::tokio::runtime::Handle::enter);
        if task.poll(&mut cx).is_ready() {
            trace!(task = %id, polls = task.poll_count, "task finished");
            return;
        }

        let woken = {
            let mut tasks = self.inner.tasks.lock();
            let woken = task.woken.swap(false, Ordering::SeqCst);
            tasks.insert(id, task);
            woken
        };
        if woken {
            self.schedule_poll(id);
        }
    }
}

impl Default for IoLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles are equal when they refer to the same loop.
impl PartialEq for IoLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IoLoop {}

impl fmt::Debug for IoLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.inner.status.lock();
        f.debug_struct("IoLoop")
            .field("status", &status)
            .field("pending_callbacks", &self.pending_callbacks())
            .field("pending_timers", &self.pending_timers())
            .field("tasks", &self.task_count())
            .finish()
    }
}

impl EventLoop for IoLoop {
    fn start(&self) -> Result<()> {
        IoLoop::start(self)
    }

    fn stop(&self) -> Result<()> {
        IoLoop::stop(self)
    }

    fn is_running(&self) -> bool {
        IoLoop::is_running(self)
    }

    fn is_closed(&self) -> bool {
        IoLoop::is_closed(self)
    }

    fn time(&self) -> Duration {
        IoLoop::time(self)
    }

    fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        IoLoop::add_callback(self, callback);
    }

    fn call_later<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        IoLoop::call_later(self, delay, callback)
    }

    fn remove_timeout(&self, handle: TimeoutHandle) -> bool {
        IoLoop::remove_timeout(self, handle)
    }

    fn spawn<F>(&self, future: F) -> PendingResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        IoLoop::spawn(self, future)
    }

    fn begin_run(&self) -> Result<RunId> {
        IoLoop::begin_run(self)
    }

    fn end_run(&self, run: RunId) -> usize {
        IoLoop::end_run(self, run)
    }
}

/// Restores the previously current loop when dropped.
#[derive(Debug)]
pub struct CurrentGuard {
    previous: Option<IoLoop>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Returns the loop to idle when `start` exits, including by unwinding.
struct RunningGuard<'a> {
    inner: &'a LoopInner,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut status = self.inner.status.lock();
        if matches!(*status, Status::Running | Status::Stopping) {
            *status = Status::Idle;
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
    }
}

/// Waker that queues a poll of its task on the loop.
struct TaskWaker {
    inner: Weak<LoopInner>,
    id: TaskId,
    /// Flag to indicate the task should be re-queued after its current poll
    woken: Arc<AtomicBool>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let io_loop = IoLoop { inner };
        let idle = {
            let tasks = io_loop.inner.tasks.lock();
            let idle = tasks.contains_key(&self.id);
            if !idle {
                // Being polled right now, or already finished.
                self.woken.store(true, Ordering::SeqCst);
            }
            idle
        };
        if idle {
            io_loop.schedule_poll(self.id);
        } else {
            warn_if_closed(&io_loop);
        }
    }
}

fn warn_if_closed(io_loop: &IoLoop) {
    if io_loop.is_closed() {
        warn!("task woken after its event loop was closed");
    }
}
