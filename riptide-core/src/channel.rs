use crate::event_loop::{EventLoop, LoopHandle};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

/// Empty interest.
pub const NONE_EVENT: u32 = 0;

/// Readable interest: data, priority data, or a peer half-close.
#[allow(clippy::cast_sign_loss)]
pub const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;

/// Writable interest.
#[allow(clippy::cast_sign_loss)]
pub const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

#[allow(clippy::cast_sign_loss)]
const HUP: u32 = libc::EPOLLHUP as u32;
#[allow(clippy::cast_sign_loss)]
const ERR: u32 = libc::EPOLLERR as u32;
#[allow(clippy::cast_sign_loss)]
const IN: u32 = libc::EPOLLIN as u32;
#[allow(clippy::cast_sign_loss)]
const PRI: u32 = libc::EPOLLPRI as u32;
#[allow(clippy::cast_sign_loss)]
const RDHUP: u32 = libc::EPOLLRDHUP as u32;
#[allow(clippy::cast_sign_loss)]
const OUT: u32 = libc::EPOLLOUT as u32;

/// Where a channel currently stands in its poller's bookkeeping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PollerState {
    /// Never handed to the poller.
    New,
    /// Present in the readiness table.
    Added,
    /// Known to the poller but deregistered (empty interest).
    Deleted,
}

/// Callback for readable events, receives the poll return timestamp.
pub type ReadCallback = Rc<dyn Fn(Instant)>;

/// Callback for writable/close/error events.
pub type EventCallback = Rc<dyn Fn()>;

/// Per-descriptor record of interest and readiness, dispatching readiness to
/// user callbacks. A channel never owns its descriptor and is bound for life
/// to one loop; every interest mutation and the dispatch itself happen on
/// that loop's thread.
pub struct Channel {
    loop_: LoopHandle,
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    state: Cell<PollerState>,
    log_hup: Cell<bool>,
    tied: Cell<bool>,
    tie: RefCell<Option<std::sync::Weak<dyn Any + Send + Sync>>>,
    read_cb: RefCell<Option<ReadCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("revents", &self.revents.get())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates a channel for `fd` owned by the loop behind `loop_`.
    #[must_use]
    pub fn new(loop_: LoopHandle, fd: RawFd) -> Rc<Channel> {
        Rc::new(Channel {
            loop_,
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(0),
            state: Cell::new(PollerState::New),
            log_hup: Cell::new(true),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    /// The descriptor this channel watches.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The handle of the owning loop.
    #[must_use]
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    /// Current interest bits.
    #[must_use]
    pub fn events(&self) -> u32 {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        self.state.get()
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.state.set(state);
    }

    /// `true` when no interest is registered.
    #[must_use]
    pub fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    /// `true` when write interest is registered.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    /// `true` when read interest is registered.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    /// Sets the readable callback.
    pub fn set_read_callback(&self, cb: impl Fn(Instant) + 'static) {
        *self.read_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Sets the writable callback.
    pub fn set_write_callback(&self, cb: impl Fn() + 'static) {
        *self.write_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Sets the close callback.
    pub fn set_close_callback(&self, cb: impl Fn() + 'static) {
        *self.close_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Sets the error callback.
    pub fn set_error_callback(&self, cb: impl Fn() + 'static) {
        *self.error_cb.borrow_mut() = Some(Rc::new(cb));
    }

    /// Ties this channel to its owner object. Dispatch upgrades the weak
    /// reference for the duration of the callbacks and skips them entirely
    /// when the owner is already gone. Strictly a liveness check, never an
    /// ownership transfer.
    pub fn tie(&self, owner: std::sync::Weak<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(owner);
        self.tied.set(true);
    }

    /// Suppress the hang-up warning log for descriptors where hang-up is
    /// routine.
    pub fn do_not_log_hup(&self) {
        self.log_hup.set(false);
    }

    /// Adds read interest and reconciles with the poller.
    pub fn enable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    /// Drops read interest and reconciles with the poller.
    pub fn disable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    /// Adds write interest and reconciles with the poller.
    pub fn enable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    /// Drops write interest and reconciles with the poller.
    pub fn disable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    /// Drops all interest and reconciles with the poller.
    pub fn disable_all(self: &Rc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    /// Removes this channel from the poller's table.
    ///
    /// # Panics
    /// if interest is not empty or the caller is not on the owning thread.
    pub fn remove(self: &Rc<Self>) {
        assert!(self.is_none_event(), "removing a channel with live interest");
        self.loop_.assert_in_loop_thread();
        if let Some(lp) = EventLoop::current() {
            lp.remove_channel(self);
        }
    }

    fn update(self: &Rc<Self>) {
        self.loop_.assert_in_loop_thread();
        if let Some(lp) = EventLoop::current() {
            lp.update_channel(self);
        } else {
            // the owning loop is mid-teardown, its poller drops with it
            crate::trace!("Channel::update on fd = {} after loop teardown", self.fd);
        }
    }

    /// Dispatches the readiness observed by the last poll. Invoked only by
    /// the owning loop, on its thread.
    pub fn handle_event(self: &Rc<Self>, receive_time: Instant) {
        if self.tied.get() {
            let guard = self.tie.borrow().as_ref().and_then(std::sync::Weak::upgrade);
            if let Some(_owner) = guard {
                self.handle_event_with_guard(receive_time);
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.revents.get();
        crate::trace!("fd = {} dispatching {}", self.fd, events_to_string(revents));

        if revents & HUP != 0 && revents & IN == 0 {
            if self.log_hup.get() {
                crate::warn!("fd = {}, Channel::handle_event() EPOLLHUP", self.fd);
            }
            let cb = self.close_cb.borrow().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        if revents & ERR != 0 {
            let cb = self.error_cb.borrow().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            let cb = self.read_cb.borrow().clone();
            if let Some(cb) = cb {
                cb(receive_time);
            }
        }
        if revents & OUT != 0 {
            let cb = self.write_cb.borrow().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.loop_.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                assert!(
                    !lp.has_channel(self),
                    "channel for fd = {} dropped while still registered",
                    self.fd
                );
            }
        }
    }
}

/// Renders readiness/interest bits the way `poll(2)` names them.
#[must_use]
pub fn events_to_string(events: u32) -> String {
    let mut out = String::new();
    if events & IN != 0 {
        out.push_str("IN ");
    }
    if events & PRI != 0 {
        out.push_str("PRI ");
    }
    if events & OUT != 0 {
        out.push_str("OUT ");
    }
    if events & HUP != 0 {
        out.push_str("HUP ");
    }
    if events & RDHUP != 0 {
        out.push_str("RDHUP ");
    }
    if events & ERR != 0 {
        out.push_str("ERR ");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bits() {
        let lp = EventLoop::new().unwrap();
        let channel = Channel::new(lp.handle(), -1);
        assert!(channel.is_none_event());
        assert!(!channel.is_reading());
        assert!(!channel.is_writing());
        assert_eq!(
            events_to_string(READ_EVENT | WRITE_EVENT),
            "IN PRI OUT "
        );
        // interest mutation on a fake fd would hit epoll_ctl, so only the
        // accessors are exercised here; the loop tests cover reconciliation.
        drop(channel);
    }
}
