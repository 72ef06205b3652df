use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys;
use riptide_timer::TimerList;
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identifies one scheduled timer for cancellation. Sequences are allocated
/// from a process-wide counter, so an id never aliases another timer even
/// across loops.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId {
    sequence: u64,
}

/// One scheduled callback, owned by the loop thread once inserted.
pub(crate) struct TimerEntry {
    sequence: u64,
    deadline: u64,
    interval: Option<Duration>,
    callback: Box<dyn Fn() + Send>,
}

impl TimerEntry {
    pub(crate) fn new(
        deadline: u64,
        interval: Option<Duration>,
        callback: Box<dyn Fn() + Send>,
    ) -> TimerEntry {
        TimerEntry {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            deadline,
            interval,
            callback,
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId {
            sequence: self.sequence,
        }
    }

    fn run(&self) {
        (self.callback)();
    }

    /// Periodic restart measures from the firing time, not the missed
    /// deadline, so a stalled loop does not replay a backlog.
    fn restart(&mut self, now: u64) {
        if let Some(interval) = self.interval {
            let nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
            self.deadline = now.saturating_add(nanos);
        }
    }
}

/// All timers of one loop, multiplexed onto a single `timerfd`. Expiration
/// and mutation both happen on the loop thread only.
pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    channel: Rc<Channel>,
    timers: TimerList<TimerEntry>,
    /// sequence -> current deadline, for O(1) cancel lookups.
    deadlines: HashMap<u64, u64>,
    calling_expired: bool,
    /// Periodic timers canceled from inside their own callback must not be
    /// rescheduled; they are popped already so cancel alone cannot see them.
    canceling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new(loop_: LoopHandle) -> std::io::Result<TimerQueue> {
        let timer_fd = sys::new_timer_fd()?;
        let raw: RawFd = timer_fd.as_raw_fd();
        let channel = Channel::new(loop_, raw);
        channel.set_read_callback(move |_| {
            match sys::read_timer_fd(raw) {
                Ok(_) => {}
                // a rearm can race the expiration we were woken for
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    crate::error!("timerfd read failed: {}", e);
                }
            }
            if let Some(lp) = EventLoop::current() {
                process_expired(&lp);
            }
        });
        Ok(TimerQueue {
            timer_fd,
            channel,
            timers: TimerList::default(),
            deadlines: HashMap::new(),
            calling_expired: false,
            canceling: HashSet::new(),
        })
    }

    /// Registers read interest for the timerfd. Split from construction
    /// because the owning loop's thread-local is not set yet inside
    /// `EventLoop::new`.
    pub(crate) fn register(&self) {
        self.channel.enable_reading();
    }

    pub(crate) fn add_timer_in_loop(&mut self, entry: TimerEntry) {
        let deadline = entry.deadline;
        let earliest_changed = self
            .timers
            .earliest_deadline()
            .map_or(true, |earliest| deadline < earliest);
        _ = self.deadlines.insert(entry.sequence, deadline);
        self.timers.insert(deadline, entry);
        if earliest_changed {
            self.arm(deadline);
        }
    }

    pub(crate) fn cancel_in_loop(&mut self, id: TimerId) {
        if let Some(deadline) = self.deadlines.remove(&id.sequence) {
            let removed = self
                .timers
                .remove_if(deadline, |entry| entry.sequence == id.sequence);
            assert!(
                removed.is_some(),
                "timer index out of sync with the timer list"
            );
        } else if self.calling_expired {
            // fired this very pass; suppress a periodic reschedule
            _ = self.canceling.insert(id.sequence);
        }
    }

    fn pop_expired(&mut self, now: u64) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        while self
            .timers
            .earliest_deadline()
            .is_some_and(|deadline| deadline <= now)
        {
            if let Some(mut batch) = self.timers.pop_front() {
                while let Some(entry) = batch.pop_front() {
                    _ = self.deadlines.remove(&entry.sequence);
                    expired.push(entry);
                }
            }
        }
        expired
    }

    fn reschedule(&mut self, expired: Vec<TimerEntry>, now: u64) {
        for mut entry in expired {
            if entry.interval.is_some() && !self.canceling.contains(&entry.sequence) {
                entry.restart(now);
                self.add_timer_in_loop(entry);
            }
        }
        self.canceling.clear();
        if let Some(next) = self.timers.earliest_deadline() {
            self.arm(next);
        }
    }

    fn arm(&self, deadline: u64) {
        let delay = deadline.saturating_sub(riptide_timer::now());
        if let Err(e) = sys::arm_timer_fd(self.timer_fd.as_raw_fd(), delay) {
            crate::error!("timerfd rearm failed: {}", e);
        }
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timer_fd", &self.timer_fd)
            .field("timers", &self.deadlines.len())
            .field("calling_expired", &self.calling_expired)
            .finish_non_exhaustive()
    }
}

/// Pops everything due, runs the callbacks with the queue unborrowed so they
/// may add or cancel timers, then reschedules periodic survivors and rearms.
pub(crate) fn process_expired(lp: &Rc<EventLoop>) {
    let now = riptide_timer::now();
    let expired = {
        let mut queue = lp.timers().borrow_mut();
        queue.calling_expired = true;
        queue.pop_expired(now)
    };
    for entry in &expired {
        entry.run();
    }
    let mut queue = lp.timers().borrow_mut();
    queue.calling_expired = false;
    queue.reschedule(expired, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[test]
    fn timers_fire_in_deadline_order() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let fired = Arc::new(Mutex::new(Vec::new()));

        // submitted out of deadline order on purpose
        for (label, delay_ms) in [(2_u32, 200_u64), (0, 0), (1, 100)] {
            let fired = fired.clone();
            _ = handle.run_after(Duration::from_millis(delay_ms), move || {
                fired.lock().unwrap().push(label);
            });
        }
        {
            let handle = handle.clone();
            _ = lp.run_after(Duration::from_millis(300), move || handle.quit());
        }
        lp.run();
        assert_eq!(*fired.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn equal_deadlines_fire_in_submission_order() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let deadline = riptide_timer::deadline_after(Duration::from_millis(50));

        for label in 0..3_u32 {
            let fired = fired.clone();
            _ = handle.run_at(deadline, move || fired.lock().unwrap().push(label));
        }
        {
            let quitter = handle.clone();
            _ = handle.run_after(Duration::from_millis(150), move || quitter.quit());
        }
        lp.run();
        assert_eq!(*fired.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn deadlines_are_honored_within_tolerance() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let start = Instant::now();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for delay_ms in [0_u64, 1000, 2000] {
            let fired = fired.clone();
            _ = handle.run_after(Duration::from_millis(delay_ms), move || {
                fired.lock().unwrap().push((delay_ms, start.elapsed()));
            });
        }
        {
            let quitter = handle.clone();
            _ = handle.run_after(Duration::from_millis(2200), move || quitter.quit());
        }
        lp.run();

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 3);
        let order: Vec<u64> = fired.iter().map(|(delay_ms, _)| *delay_ms).collect();
        assert_eq!(order, vec![0, 1000, 2000]);
        for (delay_ms, elapsed) in fired.iter() {
            let target = Duration::from_millis(*delay_ms);
            assert!(
                *elapsed >= target,
                "{delay_ms}ms timer fired early at {elapsed:?}"
            );
            assert!(
                *elapsed < target + Duration::from_millis(200),
                "{delay_ms}ms timer fired late at {elapsed:?}"
            );
        }
    }

    #[test]
    fn periodic_timer_repeats_until_canceled() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let firings = Arc::new(Mutex::new(Vec::new()));
        let id_cell = Arc::new(Mutex::new(None));

        let id = {
            let handle = handle.clone();
            let firings = firings.clone();
            let id_cell = id_cell.clone();
            handle.clone().run_every(Duration::from_millis(50), move || {
                let mut firings = firings.lock().unwrap();
                firings.push(Instant::now());
                if firings.len() == 3 {
                    if let Some(id) = *id_cell.lock().unwrap() {
                        handle.cancel(id);
                    }
                }
            })
        };
        *id_cell.lock().unwrap() = Some(id);
        {
            let quitter = handle.clone();
            _ = handle.run_after(Duration::from_millis(400), move || quitter.quit());
        }
        lp.run();

        let firings = firings.lock().unwrap();
        // canceled from within its own callback after the third firing
        assert_eq!(firings.len(), 3);
        for pair in firings.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_micros(100), "gap {gap:?} under the clamp");
            assert!(gap < Duration::from_millis(250), "gap {gap:?} far off the period");
        }
    }

    #[test]
    fn cancel_before_expiry_suppresses_the_callback() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let fired = Arc::new(AtomicBool::new(false));

        let id = {
            let fired = fired.clone();
            handle.run_after(Duration::from_millis(100), move || {
                fired.store(true, Ordering::SeqCst);
            })
        };
        handle.cancel(id);
        // canceling twice is a no-op, not an error
        handle.cancel(id);
        {
            let quitter = handle.clone();
            _ = handle.run_after(Duration::from_millis(250), move || quitter.quit());
        }
        lp.run();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cross_thread_scheduling_wakes_an_idle_loop() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        let fired = Arc::new(AtomicBool::new(false));

        let scheduler = {
            let handle = handle.clone();
            let fired = fired.clone();
            std::thread::spawn(move || {
                let quitter = handle.clone();
                _ = handle.run_after(Duration::from_millis(50), move || {
                    fired.store(true, Ordering::SeqCst);
                    quitter.quit();
                });
            })
        };
        let start = Instant::now();
        lp.run();
        scheduler.join().unwrap();
        assert!(fired.load(Ordering::SeqCst));
        // must not have waited out a full poll timeout
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
