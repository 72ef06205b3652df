use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Once;

/// Timer-source intervals shorter than this are clamped up, some timer APIs
/// treat a zero interval as "disarm".
pub(crate) const MIN_TIMER_DELAY_NS: u64 = 100_000;

/// Ignore `SIGPIPE` once per process, a peer reset must surface as `EPIPE`
/// from `write`, not kill the process.
pub(crate) fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        use nix::sys::signal::{signal, SigHandler, Signal};
        if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            crate::error!("failed to ignore SIGPIPE: {}", e);
        }
    });
}

/// Create the non-blocking wake descriptor for a loop.
pub(crate) fn new_event_fd() -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Drain one wake-up batch. Coalesced wake-ups read as a single counter.
pub(crate) fn read_event_fd(fd: RawFd) -> std::io::Result<u64> {
    let mut one = 0_u64;
    let n = unsafe { libc::read(fd, std::ptr::addr_of_mut!(one).cast(), 8) };
    if n != 8 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(one)
}

/// Signal the wake descriptor.
pub(crate) fn write_event_fd(fd: RawFd) -> std::io::Result<()> {
    let one = 1_u64;
    let n = unsafe { libc::write(fd, std::ptr::addr_of!(one).cast(), 8) };
    if n != 8 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Create the monotonic timer descriptor for a loop's timer queue.
pub(crate) fn new_timer_fd() -> std::io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Consume an expiry notification so level-triggered polling quiesces.
pub(crate) fn read_timer_fd(fd: RawFd) -> std::io::Result<u64> {
    let mut howmany = 0_u64;
    let n = unsafe { libc::read(fd, std::ptr::addr_of_mut!(howmany).cast(), 8) };
    if n != 8 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(howmany)
}

/// Re-arm the timer descriptor to fire once after `delay_ns`, clamped to
/// [`MIN_TIMER_DELAY_NS`].
pub(crate) fn arm_timer_fd(fd: RawFd, delay_ns: u64) -> std::io::Result<()> {
    let delay_ns = delay_ns.max(MIN_TIMER_DELAY_NS);
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: libc::time_t::try_from(delay_ns / 1_000_000_000).unwrap_or(libc::time_t::MAX),
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            tv_nsec: (delay_ns % 1_000_000_000) as libc::c_long,
        },
    };
    let r = unsafe { libc::timerfd_settime(fd, 0, &new_value, std::ptr::null_mut()) };
    if r < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking write of as much of `buf` as the descriptor accepts.
pub(crate) fn write(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(n as usize)
}

/// One scatter read into two buffers, bounding the syscalls per readiness
/// notification to one.
pub(crate) fn readv2(fd: RawFd, first: &mut [u8], second: &mut [u8]) -> std::io::Result<usize> {
    let iov = [
        libc::iovec {
            iov_base: first.as_mut_ptr().cast(),
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr().cast(),
            iov_len: second.len(),
        },
    ];
    let n = if first.is_empty() {
        unsafe { libc::readv(fd, iov[1..].as_ptr(), 1) }
    } else {
        unsafe { libc::readv(fd, iov.as_ptr(), 2) }
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(n as usize)
}

/// Half-close the write direction, the peer observes EOF but may keep
/// sending.
pub(crate) fn shutdown_write(fd: RawFd) -> std::io::Result<()> {
    let r = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if r < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Fetch and clear the pending `SO_ERROR` of a socket.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = libc::socklen_t::try_from(size_of::<libc::c_int>())
        .expect("c_int does not fit socklen_t");
    let r = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(optval).cast(),
            &mut optlen,
        )
    };
    if r < 0 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

/// An owned socket descriptor with the option toggles the core exposes at
/// its boundary. Accept/bind/listen/connect stay with external collaborators.
#[derive(Debug)]
pub struct Socket(OwnedFd);

impl Socket {
    /// Take ownership of `fd`, it is closed when the `Socket` drops.
    pub fn from_raw(fd: RawFd) -> Socket {
        Socket(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// The raw descriptor, still owned by this `Socket`.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Toggle `TCP_NODELAY` (disable/enable Nagle's algorithm).
    pub fn set_tcp_no_delay(&self, on: bool) -> std::io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    /// Toggle `SO_KEEPALIVE`.
    pub fn set_keep_alive(&self, on: bool) -> std::io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    /// Toggle `SO_REUSEADDR`.
    pub fn set_reuse_addr(&self, on: bool) -> std::io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    /// Toggle `SO_REUSEPORT`.
    pub fn set_reuse_port(&self, on: bool) -> std::io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    /// Half-close the write direction of this socket.
    pub fn shutdown_write(&self) -> std::io::Result<()> {
        shutdown_write(self.fd())
    }

    fn set_opt(&self, level: libc::c_int, opt: libc::c_int, on: bool) -> std::io::Result<()> {
        let optval: libc::c_int = libc::c_int::from(on);
        let r = unsafe {
            libc::setsockopt(
                self.fd(),
                level,
                opt,
                std::ptr::addr_of!(optval).cast(),
                libc::socklen_t::try_from(size_of::<libc::c_int>())
                    .expect("c_int does not fit socklen_t"),
            )
        };
        if r < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}
