use crate::channel::Channel;
use crate::poller::{new_default_poller, Poller};
use crate::sys;
use crate::timer::{TimerEntry, TimerId, TimerQueue};
use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

/// A deferred unit of work submitted from any thread, drained and executed
/// exclusively on the target loop's thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on one poll so the loop periodically re-checks its quit/task
/// state even with no I/O at all.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// The cross-thread-safe part of a loop: the pending-task list, the wake
/// signal and identity. Everything else on [`EventLoop`] belongs to the loop
/// thread alone.
struct LoopShared {
    name: String,
    thread: ThreadId,
    wakeup_fd: RawFd,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

impl std::fmt::Debug for LoopShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopShared")
            .field("name", &self.name)
            .field("thread", &self.thread)
            .field("wakeup_fd", &self.wakeup_fd)
            .finish_non_exhaustive()
    }
}

/// A `Send + Sync` handle to one [`EventLoop`]. The only operations other
/// threads may perform on a loop go through here: task submission, timers,
/// quit and thread-identity checks.
#[derive(Clone, Debug)]
pub struct LoopHandle(Arc<LoopShared>);

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LoopHandle {}

impl LoopHandle {
    /// The loop's name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// `true` when the calling thread is the loop's thread.
    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.0.thread
    }

    /// # Panics
    /// if the calling thread is not the loop's thread. Off-thread access to
    /// loop-owned state is a programming defect, not a recoverable failure.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop {} was created in thread {:?}, current thread is {:?}",
            self.0.name,
            self.0.thread,
            std::thread::current().id()
        );
    }

    /// Runs `task` synchronously when already on the loop thread, otherwise
    /// queues it for the next drain pass.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the loop's next drain pass, in FIFO submission
    /// order relative to other deferred tasks. Wakes the loop when submitted
    /// off-thread or while a drain is already in progress, so re-entrant
    /// self-submission still makes forward progress.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.0.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.0.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Asks the loop to exit after finishing its current iteration.
    /// Idempotent and callable from any thread.
    pub fn quit(&self) {
        self.0.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Schedules `cb` once at `deadline` (monotonic ns per
    /// [`riptide_timer::now`]). Callable from any thread; insertion is
    /// marshalled onto the loop thread.
    pub fn run_at(&self, deadline: u64, cb: impl Fn() + Send + 'static) -> TimerId {
        self.add_timer(deadline, None, Box::new(cb))
    }

    /// Schedules `cb` once after `delay`. Callable from any thread.
    pub fn run_after(&self, delay: Duration, cb: impl Fn() + Send + 'static) -> TimerId {
        self.add_timer(riptide_timer::deadline_after(delay), None, Box::new(cb))
    }

    /// Schedules `cb` every `interval`, first firing one `interval` from
    /// now. Each successive deadline is recomputed from the firing time, so
    /// a loop stalled past one deadline does not pile up a backlog.
    ///
    /// # Panics
    /// if `interval` is zero.
    pub fn run_every(&self, interval: Duration, cb: impl Fn() + Send + 'static) -> TimerId {
        assert!(interval > Duration::ZERO, "periodic timer needs an interval");
        self.add_timer(
            riptide_timer::deadline_after(interval),
            Some(interval),
            Box::new(cb),
        )
    }

    /// Best-effort cancellation. Canceling an already-fired or
    /// already-canceled timer is a silent no-op, and cancellation may race a
    /// timer that is firing right now.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            if let Some(lp) = EventLoop::current() {
                lp.timers().borrow_mut().cancel_in_loop(id);
            }
        });
    }

    fn add_timer(
        &self,
        deadline: u64,
        interval: Option<Duration>,
        cb: Box<dyn Fn() + Send>,
    ) -> TimerId {
        let entry = TimerEntry::new(deadline, interval, cb);
        let id = entry.id();
        self.run_in_loop(move || {
            let lp = EventLoop::current().expect("no event loop on this thread");
            lp.timers().borrow_mut().add_timer_in_loop(entry);
        });
        id
    }

    pub(crate) fn wakeup(&self) {
        if let Err(e) = sys::write_event_fd(self.0.wakeup_fd) {
            crate::error!("EventLoop {} wakeup failed: {}", self.0.name, e);
        }
    }
}

/// A single-threaded reactor: one poller, one timer queue, one pending-task
/// list. Exactly one thread — the one that constructed it — may run it and
/// touch its state; other threads go through the [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    /// Owns the wake descriptor; `LoopShared` only carries the raw fd.
    _wakeup_fd: OwnedFd,
    wakeup_channel: Rc<Channel>,
    poller: RefCell<Box<dyn Poller>>,
    timers: RefCell<TimerQueue>,
    looping: Cell<bool>,
    stopped: Cell<bool>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("shared", &self.shared)
            .field("looping", &self.looping.get())
            .field("stopped", &self.stopped.get())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Creates the loop for the calling thread and registers it as this
    /// thread's loop.
    ///
    /// # Errors
    /// if the readiness backend, the wake descriptor or the timer source
    /// cannot be created.
    ///
    /// # Panics
    /// if this thread already owns a loop.
    pub fn new() -> std::io::Result<Rc<EventLoop>> {
        sys::ignore_sigpipe();
        assert!(
            EventLoop::current().is_none(),
            "another EventLoop already exists in this thread"
        );
        let wakeup_fd = sys::new_event_fd()?;
        let raw_wakeup = wakeup_fd.as_raw_fd();
        let shared = Arc::new(LoopShared {
            name: format!("EventLoop-{}", uuid::Uuid::new_v4()),
            thread: std::thread::current().id(),
            wakeup_fd: raw_wakeup,
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });
        let handle = LoopHandle(shared.clone());
        let poller = new_default_poller()?;
        let timers = TimerQueue::new(handle.clone())?;
        let wakeup_channel = Channel::new(handle, raw_wakeup);
        wakeup_channel.set_read_callback(move |_| match sys::read_event_fd(raw_wakeup) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                crate::error!("EventLoop wakeup read failed: {}", e);
            }
        });

        let lp = Rc::new(EventLoop {
            shared,
            _wakeup_fd: wakeup_fd,
            wakeup_channel,
            poller: RefCell::new(poller),
            timers: RefCell::new(timers),
            looping: Cell::new(false),
            stopped: Cell::new(false),
        });
        LOOP_IN_THIS_THREAD.with(|current| *current.borrow_mut() = Rc::downgrade(&lp));
        // interest registration needs the thread-local set up first
        lp.wakeup_channel.enable_reading();
        lp.timers.borrow().register();
        crate::debug!(
            "created {} in thread {:?}",
            lp.shared.name,
            lp.shared.thread
        );
        Ok(lp)
    }

    /// The loop registered for the calling thread, while it is alive.
    #[must_use]
    pub fn current() -> Option<Rc<EventLoop>> {
        LOOP_IN_THIS_THREAD.with(|current| current.borrow().upgrade())
    }

    /// A cloneable cross-thread handle to this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle(self.shared.clone())
    }

    /// See [`LoopHandle::is_in_loop_thread`].
    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread
    }

    /// See [`LoopHandle::assert_in_loop_thread`].
    pub fn assert_in_loop_thread(&self) {
        self.handle().assert_in_loop_thread();
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    /// See [`LoopHandle::queue_in_loop`].
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    /// See [`LoopHandle::run_after`].
    pub fn run_after(&self, delay: Duration, cb: impl Fn() + Send + 'static) -> TimerId {
        self.handle().run_after(delay, cb)
    }

    /// See [`LoopHandle::run_every`].
    pub fn run_every(&self, interval: Duration, cb: impl Fn() + Send + 'static) -> TimerId {
        self.handle().run_every(interval, cb)
    }

    /// See [`LoopHandle::cancel`].
    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }

    /// See [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Runs the poll/dispatch/drain cycle until [`LoopHandle::quit`]. A loop
    /// runs at most once; it is not restartable.
    ///
    /// # Panics
    /// if called off the owning thread or after the loop already ran.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.looping.get() && !self.stopped.get(),
            "EventLoop {} is not restartable",
            self.shared.name
        );
        self.looping.set(true);
        crate::debug!("{} start looping", self.shared.name);

        let mut active: Vec<Rc<Channel>> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self.poller.borrow_mut().poll(POLL_TIMEOUT, &mut active);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.do_pending_tasks();
        }

        self.looping.set(false);
        self.stopped.set(true);
        crate::debug!("{} stop looping", self.shared.name);
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        assert!(
            *channel.owner_loop() == self.handle(),
            "channel for fd = {} belongs to another loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        assert!(
            *channel.owner_loop() == self.handle(),
            "channel for fd = {} belongs to another loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerQueue> {
        &self.timers
    }

    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks: Vec<Task> = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        crate::debug!(
            "{} of thread {:?} destructs in thread {:?}",
            self.shared.name,
            self.shared.thread,
            std::thread::current().id()
        );
        LOOP_IN_THIS_THREAD.with(|current| *current.borrow_mut() = Weak::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn run_in_loop_is_synchronous_on_the_loop_thread() {
        let lp = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        lp.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        // before the loop even runs
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cross_thread_tasks_run_in_fifo_order() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let submitter = {
            let handle = handle.clone();
            let order = order.clone();
            std::thread::spawn(move || {
                for i in 0..5_u32 {
                    let order = order.clone();
                    handle.queue_in_loop(move || order.lock().unwrap().push(i));
                }
                handle.queue_in_loop({
                    let handle = handle.clone();
                    move || handle.quit()
                });
            })
        };
        lp.run();
        submitter.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reentrant_submission_during_drain_makes_progress() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let hits = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = mpsc::channel();
        let submitter = {
            let handle = handle.clone();
            let hits = hits.clone();
            std::thread::spawn(move || {
                let inner_handle = handle.clone();
                handle.queue_in_loop(move || {
                    _ = hits.fetch_add(1, Ordering::SeqCst);
                    // submitted mid-drain, must still execute
                    let handle = inner_handle.clone();
                    let hits = hits.clone();
                    inner_handle.queue_in_loop(move || {
                        _ = hits.fetch_add(1, Ordering::SeqCst);
                        handle.quit();
                    });
                });
                tx.send(()).unwrap();
            })
        };
        rx.recv().unwrap();
        lp.run();
        submitter.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn quit_is_idempotent_and_remote() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let remote = std::thread::spawn(move || {
            handle.quit();
            handle.quit();
        });
        remote.join().unwrap();
        // quit before run is not lost
        lp.run();
        assert!(lp.stopped.get());
    }

    #[test]
    #[should_panic(expected = "not restartable")]
    fn a_stopped_loop_cannot_run_again() {
        let lp = EventLoop::new().unwrap();
        lp.quit();
        lp.run();
        lp.run();
    }

    #[test]
    #[should_panic(expected = "another EventLoop already exists in this thread")]
    fn one_loop_per_thread() {
        let first = EventLoop::new().unwrap();
        let second = EventLoop::new();
        drop(second);
        drop(first);
    }

    #[test]
    fn off_thread_mutation_is_fatal() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let off = std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handle.assert_in_loop_thread();
            }));
            result.is_err()
        });
        assert!(off.join().unwrap());
    }
}
