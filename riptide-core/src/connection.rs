use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::{self, Socket};
use std::any::Any;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Backlog size at which the high-water-mark callback fires, unless
/// overridden per connection.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Where a connection stands in its life. Transitions only move forward:
/// Connecting, Connected, Disconnecting, Disconnected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, not yet attached to its loop.
    Connecting = 0,
    /// Live: reading, writable, the normal state.
    Connected = 1,
    /// Half-closing: waiting for the backlog to drain.
    Disconnecting = 2,
    /// Fully torn down; terminal.
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Invoked on establishment and on teardown; distinguish by
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with freshly read bytes; consume what you can, the rest stays
/// buffered for the next read.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
/// Invoked once the outgoing backlog fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked when the outgoing backlog crosses the high-water mark from below.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
/// Internal teardown hook for the owner's connection registry.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Loop-thread-only state.
struct ConnInner {
    input: Buffer,
    output: Buffer,
    high_water_mark: usize,
    /// A fatal send error was observed; later sends stop buffering since
    /// nothing buffered can ever be flushed.
    faulted: bool,
    reading: bool,
}

struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established TCP stream bound for life to one loop. The `Arc` may be
/// held and its `send`/`shutdown`/`force_close` entry points called from any
/// thread; everything stateful is marshalled to and executed on the loop
/// thread.
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    socket: Socket,
    channel: Rc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    inner: RefCell<ConnInner>,
    callbacks: RefCell<Callbacks>,
}

// Safety: `channel` and `inner` are touched only on the loop thread, enforced
// by assert_in_loop_thread on every access path. `callbacks` is written before
// the connection is shared (setup) and read on the loop thread afterwards.
// Cross-thread entry points go through the loop's task queue. `state` is
// atomic.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.socket.fd())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl TcpConnection {
    /// Wraps an already-connected socket. The caller (an acceptor or
    /// connector) hands over ownership of the descriptor; the connection is
    /// inert until [`TcpConnection::connect_established`] runs on the loop
    /// thread.
    #[must_use]
    pub fn new(
        loop_: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_keep_alive(true) {
            crate::warn!("TcpConnection::new [{}] SO_KEEPALIVE failed: {}", name, e);
        }
        Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Channel::new(loop_.clone(), socket.fd());
            // peer hang-up is the ordinary end of a stream, not worth a warn
            channel.do_not_log_hup();
            {
                let weak = weak.clone();
                channel.set_read_callback(move |receive_time| {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_read(receive_time);
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_write_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_write();
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_close_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_close();
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_error_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_error();
                    }
                });
            }
            crate::debug!("TcpConnection::new [{}] fd = {}", name, socket.fd());
            TcpConnection {
                loop_,
                name,
                socket,
                channel,
                local_addr,
                peer_addr,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                inner: RefCell::new(ConnInner {
                    input: Buffer::new(),
                    output: Buffer::new(),
                    high_water_mark: DEFAULT_HIGH_WATER_MARK,
                    faulted: false,
                    reading: false,
                }),
                callbacks: RefCell::new(Callbacks {
                    connection: None,
                    message: None,
                    write_complete: None,
                    high_water_mark: None,
                    close: None,
                }),
            }
        })
    }

    /// The owner-assigned name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The handle of the loop this connection lives on.
    #[must_use]
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    /// The local endpoint, as reported by the creator.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote endpoint, as reported by the creator.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current position in the connection life cycle.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `true` only in the Connected state.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Toggle `TCP_NODELAY` on the underlying socket.
    ///
    /// # Errors
    /// if the setsockopt call fails.
    pub fn set_tcp_no_delay(&self, on: bool) -> std::io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Observer for establishment and teardown transitions.
    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.borrow_mut().connection = Some(Arc::new(cb));
    }

    /// Consumer for incoming bytes.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.callbacks.borrow_mut().message = Some(Arc::new(cb));
    }

    /// Notified each time the outgoing backlog fully drains.
    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.callbacks.borrow_mut().write_complete = Some(Arc::new(cb));
    }

    /// Replaces the high-water mark and its callback together.
    pub fn set_high_water_mark(
        &self,
        mark: usize,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        self.inner.borrow_mut().high_water_mark = mark;
        self.callbacks.borrow_mut().high_water_mark = Some(Arc::new(cb));
    }

    /// Owner-side teardown hook, runs strictly after the connection callback
    /// when the stream closes.
    pub fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.borrow_mut().close = Some(Arc::new(cb));
    }

    /// Finishes establishment on the loop thread: Connecting becomes
    /// Connected, read interest goes live, the connection callback fires.
    ///
    /// # Panics
    /// if called off the loop thread or out of the Connecting state.
    pub fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        let weak: Weak<TcpConnection> = Arc::downgrade(self);
        let guard: Weak<dyn Any + Send + Sync> = weak;
        self.channel.tie(guard);
        self.inner.borrow_mut().reading = true;
        self.channel.enable_reading();
        self.run_connection_callback();
    }

    /// Final teardown on the loop thread. A stream still Connected or
    /// half-closed (Disconnecting) has not been through the close path, so
    /// interest is dropped and the connection callback runs here; then the
    /// channel leaves the loop for good.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            self.run_connection_callback();
        }
        self.channel.remove();
    }

    /// Queues `data` for delivery. Outside Connected this is a logged no-op;
    /// off-thread callers pay one copy for the marshalling.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            crate::warn!("TcpConnection [{}] send on a closed stream, dropped", self.name);
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let weak = Arc::downgrade(self);
            self.loop_.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&owned);
                }
            });
        }
    }

    /// Half-closes the write side once the outgoing backlog drains. Reading
    /// continues until the peer closes.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let weak = Arc::downgrade(self);
            self.loop_.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.shutdown_in_loop();
                }
            });
        }
    }

    /// Tears the connection down without waiting for the backlog. The close
    /// path still runs exactly once.
    pub fn force_close(self: &Arc<Self>) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnecting);
            let weak = Arc::downgrade(self);
            self.loop_.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close_in_loop();
                }
            });
        }
    }

    /// [`TcpConnection::force_close`] after `delay`. Holds only a weak
    /// reference, so a connection that dies in the meantime is simply left
    /// alone.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            let weak = Arc::downgrade(self);
            _ = self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resumes read interest after [`TcpConnection::stop_read`].
    pub fn start_read(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.loop_.run_in_loop(move || {
            if let Some(conn) = weak.upgrade() {
                let mut inner = conn.inner.borrow_mut();
                if !inner.reading || !conn.channel.is_reading() {
                    inner.reading = true;
                    drop(inner);
                    conn.channel.enable_reading();
                }
            }
        });
    }

    /// Drops read interest; incoming bytes back up in the kernel until
    /// resumed. The close event still arrives via the write path or a
    /// failing send.
    pub fn stop_read(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.loop_.run_in_loop(move || {
            if let Some(conn) = weak.upgrade() {
                let mut inner = conn.inner.borrow_mut();
                if inner.reading || conn.channel.is_reading() {
                    inner.reading = false;
                    drop(inner);
                    conn.channel.disable_reading();
                }
            }
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn run_connection_callback(self: &Arc<Self>) {
        let cb = self.callbacks.borrow().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        } else {
            crate::trace!(
                "TcpConnection [{}] {} -> {} is {}",
                self.name,
                self.local_addr,
                self.peer_addr,
                if self.connected() { "UP" } else { "DOWN" }
            );
        }
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let result = self.inner.borrow_mut().input.read_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                crate::trace!("TcpConnection [{}] received {} bytes", self.name, n);
                let cb = self.callbacks.borrow().message.clone();
                if let Some(cb) = cb {
                    // the buffer leaves the cell so the callback may call
                    // send/shutdown on this connection without re-borrowing
                    let mut input = std::mem::take(&mut self.inner.borrow_mut().input);
                    cb(self, &mut input, receive_time);
                    self.inner.borrow_mut().input = input;
                } else {
                    self.inner.borrow_mut().input.retrieve_all();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                crate::error!("TcpConnection [{}] read failed: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            crate::trace!("TcpConnection [{}] is down, no more writing", self.name);
            return;
        }
        let result = {
            let inner = self.inner.borrow();
            sys::write(self.channel.fd(), inner.output.peek())
        };
        match result {
            Ok(n) => {
                let drained = {
                    let mut inner = self.inner.borrow_mut();
                    inner.output.retrieve(n);
                    inner.output.readable_bytes() == 0
                };
                if drained {
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                crate::error!("TcpConnection [{}] write failed: {}", self.name, e);
            }
        }
    }

    /// The single close path. Every close reason funnels here, on the loop
    /// thread, exactly once; the connection callback runs before the close
    /// callback so observers see DOWN before the owner drops its reference.
    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        assert!(
            state == ConnectionState::Connected || state == ConnectionState::Disconnecting,
            "TcpConnection [{}] closing from state {:?}",
            self.name,
            state
        );
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();
        self.run_connection_callback();
        let cb = self.callbacks.borrow().close.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let err = sys::socket_error(self.channel.fd());
        crate::error!(
            "TcpConnection [{}] SO_ERROR = {} {}",
            self.name,
            err,
            std::io::Error::from_raw_os_error(err)
        );
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            crate::warn!("TcpConnection [{}] disconnected, give up writing", self.name);
            return;
        }
        let mut written = 0_usize;
        let mut faulted = self.inner.borrow().faulted;
        let backlog_empty = !self.channel.is_writing()
            && self.inner.borrow().output.readable_bytes() == 0;
        // write straight through only when nothing is queued ahead
        if backlog_empty && !faulted {
            match sys::write(self.channel.fd(), data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    crate::error!("TcpConnection [{}] send failed: {}", self.name, e);
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        faulted = true;
                        self.inner.borrow_mut().faulted = true;
                    }
                }
            }
        }
        let remaining = &data[written..];
        if faulted || remaining.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            let old_len = inner.output.readable_bytes();
            let new_len = old_len + remaining.len();
            if old_len < inner.high_water_mark && new_len >= inner.high_water_mark {
                let cb = self.callbacks.borrow().high_water_mark.clone();
                if let Some(cb) = cb {
                    let weak = Arc::downgrade(self);
                    self.loop_.queue_in_loop(move || {
                        if let Some(conn) = weak.upgrade() {
                            cb(&conn, new_len);
                        }
                    });
                }
            }
            inner.output.append(remaining);
        }
        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                crate::error!("TcpConnection [{}] shutdown failed: {}", self.name, e);
            }
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        let state = self.state();
        // a read-side close may have beaten the queued force_close here
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.handle_close();
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let cb = self.callbacks.borrow().write_complete.clone();
        if let Some(cb) = cb {
            let weak = Arc::downgrade(self);
            self.loop_.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    cb(&conn);
                }
            });
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        crate::debug!(
            "TcpConnection [{}] fd = {} dropped in state {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop_thread::EventLoopThread;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn socketpair() -> (Socket, UnixStream) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let r = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(r, 0, "socketpair failed");
        let peer = unsafe { UnixStream::from_raw_fd(fds[1]) };
        peer.set_nonblocking(false).unwrap();
        (Socket::from_raw(fds[0]), peer)
    }

    fn dummy_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn establish(
        handle: &LoopHandle,
        socket: Socket,
        configure: impl FnOnce(&Arc<TcpConnection>) + Send + 'static,
    ) -> Arc<TcpConnection> {
        let conn = TcpConnection::new(
            handle.clone(),
            "test-conn".into(),
            socket,
            dummy_addr(),
            dummy_addr(),
        );
        configure(&conn);
        let (tx, rx) = mpsc::channel();
        {
            let conn = conn.clone();
            handle.run_in_loop(move || {
                conn.connect_established();
                tx.send(()).unwrap();
            });
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        conn
    }

    fn destroy(handle: &LoopHandle, conn: &Arc<TcpConnection>) {
        let (tx, rx) = mpsc::channel();
        let conn = conn.clone();
        handle.run_in_loop(move || {
            conn.connect_destroyed();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn echoes_what_the_peer_sends() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, mut peer) = socketpair();

        let conn = establish(&handle, socket, |conn| {
            conn.set_message_callback(|conn, buf, _| {
                let bytes = buf.retrieve_as_bytes(buf.readable_bytes());
                conn.send(&bytes);
            });
        });
        assert!(conn.connected());

        peer.write_all(b"hello riptide").unwrap();
        let mut echoed = [0_u8; 13];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello riptide");
        destroy(&handle, &conn);
    }

    #[test]
    fn peer_close_fires_the_close_path_exactly_once() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, peer) = socketpair();

        let downs = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let conn = establish(&handle, socket, {
            let downs = downs.clone();
            let closes = closes.clone();
            move |conn| {
                let downs = downs.clone();
                conn.set_connection_callback(move |conn| {
                    if !conn.connected() {
                        _ = downs.fetch_add(1, Ordering::SeqCst);
                    }
                });
                conn.set_close_callback(move |conn| {
                    // connection callback strictly first
                    assert_eq!(closes.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(conn.state(), ConnectionState::Disconnected);
                    tx.send(()).unwrap();
                });
            }
        });

        drop(peer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // a late force_close must not re-fire the close path
        conn.force_close();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        destroy(&handle, &conn);
    }

    #[test]
    fn force_close_is_idempotent() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, _peer) = socketpair();

        let closes = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let conn = establish(&handle, socket, {
            let closes = closes.clone();
            move |conn| {
                conn.set_close_callback(move |_| {
                    _ = closes.fetch_add(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                });
            }
        });

        conn.force_close();
        conn.force_close();
        conn.force_close();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        destroy(&handle, &conn);
    }

    #[test]
    fn write_complete_fires_after_the_backlog_drains() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, mut peer) = socketpair();

        let (tx, rx) = mpsc::channel();
        let conn = establish(&handle, socket, move |conn| {
            conn.set_write_complete_callback(move |_| {
                tx.send(()).unwrap();
            });
        });

        let payload = vec![0xAB_u8; 256 * 1024];
        conn.send(&payload);
        let mut sunk = vec![0_u8; payload.len()];
        peer.read_exact(&mut sunk).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sunk, payload);
        destroy(&handle, &conn);
    }

    #[test]
    fn high_water_mark_fires_once_per_crossing() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, mut peer) = socketpair();

        let crossings = Arc::new(AtomicUsize::new(0));
        let conn = establish(&handle, socket, {
            let crossings = crossings.clone();
            move |conn| {
                conn.set_high_water_mark(64 * 1024, move |_, len| {
                    assert!(len >= 64 * 1024);
                    _ = crossings.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        // the peer reads nothing, so repeated sends pile up in the backlog
        // past the mark; only the first below-to-above transition reports
        let chunk = vec![0_u8; 512 * 1024];
        for _ in 0..4 {
            let conn = conn.clone();
            let chunk = chunk.clone();
            let (tx, rx) = mpsc::channel();
            handle.run_in_loop(move || {
                conn.send_in_loop(&chunk);
                tx.send(()).unwrap();
            });
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(crossings.load(Ordering::SeqCst), 1);

        // drain the peer so teardown is not blocked on a full socket
        peer.set_nonblocking(true).unwrap();
        let mut sink = vec![0_u8; 1024 * 1024];
        while let Ok(n) = peer.read(&mut sink) {
            if n == 0 {
                break;
            }
        }
        destroy(&handle, &conn);
    }

    #[test]
    fn shutdown_half_closes_after_the_backlog() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, mut peer) = socketpair();

        let conn = establish(&handle, socket, |_| {});
        conn.send(b"last words");
        conn.shutdown();
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        let mut received = Vec::new();
        // EOF only after everything queued made it out
        _ = peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"last words");
        destroy(&handle, &conn);
    }

    #[test]
    fn destroying_a_half_closed_stream_runs_the_down_callback() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, peer) = socketpair();

        let downs = Arc::new(AtomicUsize::new(0));
        let conn = establish(&handle, socket, {
            let downs = downs.clone();
            move |conn| {
                conn.set_connection_callback(move |conn| {
                    if !conn.connected() {
                        _ = downs.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        conn.shutdown();
        // the peer keeps its side open, so no close event ever arrives;
        // the owner tears the connection down while it is still half-closed
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
        destroy(&handle, &conn);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        drop(peer);
    }

    #[test]
    fn send_after_close_is_dropped_not_fatal() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, peer) = socketpair();

        let (tx, rx) = mpsc::channel();
        let conn = establish(&handle, socket, move |conn| {
            conn.set_close_callback(move |_| tx.send(()).unwrap());
        });
        drop(peer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        conn.send(b"into the void");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        destroy(&handle, &conn);
    }

    #[test]
    fn stop_read_backs_data_up_until_resumed() {
        let mut lt = EventLoopThread::new();
        let handle = lt.start_loop().unwrap();
        let (socket, mut peer) = socketpair();

        let received = Arc::new(AtomicUsize::new(0));
        let conn = establish(&handle, socket, {
            let received = received.clone();
            move |conn| {
                conn.set_message_callback(move |_, buf, _| {
                    _ = received.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
                    buf.retrieve_all();
                });
            }
        });

        conn.stop_read();
        std::thread::sleep(Duration::from_millis(50));
        peer.write_all(b"parked").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(received.load(Ordering::SeqCst), 0);

        conn.start_read();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(received.load(Ordering::SeqCst), 6);
        destroy(&handle, &conn);
    }
}
