use crate::channel::{Channel, PollerState};
use crate::poller::Poller;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Level-triggered `epoll(7)` readiness backend.
pub struct EpollPoller {
    epoll_fd: OwnedFd,
    /// Kernel-facing readiness buffer, doubled whenever a poll fills it so
    /// no ready event is ever dropped to exhaustion.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl std::fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollPoller")
            .field("epoll_fd", &self.epoll_fd)
            .field("event_capacity", &self.events.len())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl EpollPoller {
    /// # Errors
    /// if the epoll instance cannot be created.
    pub fn new() -> std::io::Result<EpollPoller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: u64::try_from(channel.fd()).expect("negative fd in epoll_ctl"),
        };
        crate::trace!(
            "epoll_ctl op = {}, fd = {}, events = {}",
            op_to_string(op),
            channel.fd(),
            crate::channel::events_to_string(channel.events())
        );
        let r = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut event) };
        if r < 0 {
            let e = std::io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                crate::error!("epoll_ctl DEL fd = {}: {}", channel.fd(), e);
            } else {
                panic!(
                    "epoll_ctl {} fd = {} failed: {e}",
                    op_to_string(op),
                    channel.fd()
                );
            }
        }
    }

    fn fill_active_channels(&self, ready: usize, active: &mut Vec<Rc<Channel>>) {
        for event in &self.events[..ready] {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let fd = { event.u64 } as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("epoll reported a descriptor without a channel");
            channel.set_revents({ event.events });
            active.push(channel.clone());
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Rc<Channel>>) -> Instant {
        crate::trace!("fd total count {}", self.channels.len());
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ready = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                i32::try_from(self.events.len()).unwrap_or(i32::MAX),
                timeout_ms,
            )
        };
        let now = Instant::now();
        if ready > 0 {
            crate::trace!("EpollPoller::poll: {} events happened", ready);
            #[allow(clippy::cast_sign_loss)]
            let ready = ready as usize;
            self.fill_active_channels(ready, active);
            if ready == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if ready == 0 {
            crate::trace!("EpollPoller::poll: nothing happened");
        } else {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EINTR) {
                crate::error!("EpollPoller::poll: {}", e);
                panic!("EpollPoller::poll failed: {e}");
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let state = channel.poller_state();
        let fd = channel.fd();
        crate::trace!(
            "fd = {}, events = {}, state = {:?}",
            fd,
            channel.events(),
            state
        );
        if state == PollerState::New || state == PollerState::Deleted {
            if state == PollerState::New {
                assert!(
                    !self.channels.contains_key(&fd),
                    "new channel fd = {fd} already in the table"
                );
                _ = self.channels.insert(fd, channel.clone());
            } else {
                assert!(
                    self.channels
                        .get(&fd)
                        .is_some_and(|known| Rc::ptr_eq(known, channel)),
                    "deleted channel fd = {fd} unknown to this poller"
                );
            }
            channel.set_poller_state(PollerState::Added);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else if channel.is_none_event() {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
            channel.set_poller_state(PollerState::Deleted);
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, channel);
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        crate::trace!("remove fd = {}", fd);
        assert!(self.channels.contains_key(&fd), "removing unknown fd = {fd}");
        assert!(channel.is_none_event(), "removing fd = {fd} with interest");
        let state = channel.poller_state();
        assert!(state == PollerState::Added || state == PollerState::Deleted);
        _ = self.channels.remove(&fd);
        if state == PollerState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains_key(&channel.fd())
    }
}

fn op_to_string(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_DEL => "DEL",
        libc::EPOLL_CTL_MOD => "MOD",
        _ => "Unknown Operation",
    }
}
