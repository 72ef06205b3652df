use crate::channel::{Channel, PollerState};
use crate::poller::Poller;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Level-triggered `poll(2)` readiness backend. One `pollfd` slot per known
/// channel; a channel whose interest went empty keeps its slot with a
/// negated descriptor so the kernel skips it until re-enabled.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    /// fd -> slot in `pollfds`, maintained across swap-removal.
    positions: HashMap<RawFd, usize>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl std::fmt::Debug for PollPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollPoller")
            .field("slots", &self.pollfds.len())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl PollPoller {
    /// An empty slot table; registration happens through
    /// [`Poller::update_channel`].
    #[must_use]
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            positions: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, ready: libc::c_int, active: &mut Vec<Rc<Channel>>) {
        let mut remaining = ready;
        for pfd in &self.pollfds {
            if remaining <= 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let channel = self
                .channels
                .get(&pfd.fd)
                .expect("poll reported a descriptor without a channel");
            channel.set_revents(poll_to_readiness(pfd.revents));
            active.push(channel.clone());
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Rc<Channel>>) -> Instant {
        crate::trace!("fd total count {}", self.channels.len());
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ready = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                libc::nfds_t::try_from(self.pollfds.len())
                    .expect("too many descriptors for poll"),
                timeout_ms,
            )
        };
        let now = Instant::now();
        if ready > 0 {
            crate::trace!("PollPoller::poll: {} events happened", ready);
            self.fill_active_channels(ready, active);
        } else if ready == 0 {
            crate::trace!("PollPoller::poll: nothing happened");
        } else {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EINTR) {
                crate::error!("PollPoller::poll: {}", e);
                panic!("PollPoller::poll failed: {e}");
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        crate::trace!(
            "fd = {}, events = {}, state = {:?}",
            fd,
            channel.events(),
            channel.poller_state()
        );
        let idx = if channel.poller_state() == PollerState::New {
            assert!(
                !self.positions.contains_key(&fd),
                "new channel fd = {fd} already in the table"
            );
            self.pollfds.push(libc::pollfd {
                fd,
                events: 0,
                revents: 0,
            });
            _ = self.positions.insert(fd, self.pollfds.len() - 1);
            _ = self.channels.insert(fd, channel.clone());
            self.pollfds.len() - 1
        } else {
            *self
                .positions
                .get(&fd)
                .expect("updating a channel unknown to this poller")
        };
        let pfd = &mut self.pollfds[idx];
        pfd.events = interest_to_poll(channel.events());
        pfd.revents = 0;
        if channel.is_none_event() {
            // negative descriptors are skipped by the kernel
            pfd.fd = -fd - 1;
            channel.set_poller_state(PollerState::Deleted);
        } else {
            pfd.fd = fd;
            channel.set_poller_state(PollerState::Added);
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        crate::trace!("remove fd = {}", fd);
        assert!(channel.is_none_event(), "removing fd = {fd} with interest");
        let state = channel.poller_state();
        assert!(state == PollerState::Added || state == PollerState::Deleted);
        let Some(idx) = self.positions.remove(&fd) else {
            panic!("removing unknown fd = {fd}")
        };
        _ = self.channels.remove(&fd);
        _ = self.pollfds.swap_remove(idx);
        if idx < self.pollfds.len() {
            // the slot now holds the previously-last descriptor
            let moved = self.pollfds[idx].fd;
            let moved_fd = if moved < 0 { -moved - 1 } else { moved };
            _ = self.positions.insert(moved_fd, idx);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(&channel.fd())
    }
}

#[allow(clippy::cast_sign_loss)]
fn interest_to_poll(events: u32) -> libc::c_short {
    let mut out: libc::c_short = 0;
    if events & (libc::EPOLLIN as u32) != 0 {
        out |= libc::POLLIN;
    }
    if events & (libc::EPOLLPRI as u32) != 0 {
        out |= libc::POLLPRI;
    }
    if events & (libc::EPOLLOUT as u32) != 0 {
        out |= libc::POLLOUT;
    }
    out
}

#[allow(clippy::cast_sign_loss)]
fn poll_to_readiness(revents: libc::c_short) -> u32 {
    let mut out = 0_u32;
    if revents & libc::POLLIN != 0 {
        out |= libc::EPOLLIN as u32;
    }
    if revents & libc::POLLPRI != 0 {
        out |= libc::EPOLLPRI as u32;
    }
    if revents & libc::POLLOUT != 0 {
        out |= libc::EPOLLOUT as u32;
    }
    if revents & libc::POLLRDHUP != 0 {
        out |= libc::EPOLLRDHUP as u32;
    }
    // an invalid descriptor surfaces on the error path like a socket error
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        out |= libc::EPOLLERR as u32;
    }
    if revents & libc::POLLHUP != 0 {
        out |= libc::EPOLLHUP as u32;
    }
    out
}
