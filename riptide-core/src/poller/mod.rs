use crate::channel::Channel;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
mod poll;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;
#[cfg(target_os = "linux")]
pub use poll::PollPoller;

/// A replaceable level-triggered readiness backend. Every method must be
/// called from the owning loop's thread; the loop enforces this before
/// delegating.
pub trait Poller {
    /// Blocks up to `timeout` for registered descriptors to become ready,
    /// fills `active` with the ready channels in the order the kernel
    /// reported them, and returns the poll return timestamp. Zero readiness
    /// is an empty fill, not an error.
    ///
    /// # Panics
    /// on an unrecoverable backend failure; no partial poll result is
    /// allowed to propagate.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Rc<Channel>>) -> Instant;

    /// Adds or modifies `channel`'s interest in the readiness table. A
    /// channel whose interest became empty is deregistered from the kernel
    /// but stays known until [`Poller::remove_channel`].
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Forgets `channel` entirely.
    ///
    /// # Panics
    /// if the channel still holds interest or was never added.
    fn remove_channel(&mut self, channel: &Channel);

    /// `true` while `channel` is known to this backend.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// The default backend for this platform. Setting `RIPTIDE_USE_POLL` in the
/// environment selects the `poll(2)` backend instead.
pub fn new_default_poller() -> std::io::Result<Box<dyn Poller>> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            if std::env::var_os("RIPTIDE_USE_POLL").is_some() {
                Ok(Box::new(PollPoller::new()))
            } else {
                Ok(Box::new(EpollPoller::new()?))
            }
        } else {
            compile_error!("no readiness poller backend for this platform")
        }
    }
}
