use crate::event_loop::{EventLoop, LoopHandle};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Runs after the loop exists on its thread, before the loop starts and
/// before [`EventLoopThread::start_loop`] returns.
pub type ThreadInitCallback = Box<dyn FnOnce(&LoopHandle) + Send>;

/// Owns one background thread whose whole life is a single [`EventLoop`]
/// run. Dropping the owner quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    core: Option<core_affinity::CoreId>,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopThread")
            .field("name", &self.name)
            .field("core", &self.core)
            .field("started", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for EventLoopThread {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoopThread {
    /// A loop thread with a generated name.
    #[must_use]
    pub fn new() -> EventLoopThread {
        EventLoopThread::with_name(format!("loop-thread-{}", uuid::Uuid::new_v4()))
    }

    /// A loop thread named `name`, visible in thread listings and logs.
    #[must_use]
    pub fn with_name(name: String) -> EventLoopThread {
        EventLoopThread {
            name,
            init: None,
            core: None,
            handle: None,
            thread: None,
        }
    }

    /// Installs a callback that runs on the loop thread once the loop is
    /// constructed, before it starts polling.
    pub fn set_init(&mut self, init: impl FnOnce(&LoopHandle) + Send + 'static) {
        self.init = Some(Box::new(init));
    }

    /// Pins the spawned thread to `core` before the loop is created.
    pub fn pin_to(&mut self, core: core_affinity::CoreId) {
        self.core = Some(core);
    }

    /// The running loop's handle, once [`EventLoopThread::start_loop`]
    /// succeeded.
    #[must_use]
    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }

    /// Spawns the thread and blocks until its loop is live, returning the
    /// loop's handle.
    ///
    /// # Errors
    /// if the thread cannot be spawned or the loop cannot be created on it.
    ///
    /// # Panics
    /// if called twice.
    pub fn start_loop(&mut self) -> std::io::Result<LoopHandle> {
        assert!(self.thread.is_none(), "loop thread {} already started", self.name);
        let state = Arc::new((Mutex::new(None::<std::io::Result<LoopHandle>>), Condvar::new()));
        let publish = state.clone();
        let init = self.init.take();
        let core = self.core;
        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                if let Some(core) = core {
                    _ = core_affinity::set_for_current(core);
                }
                let send = |result: std::io::Result<LoopHandle>| {
                    let (lock, cvar) = &*publish;
                    *lock.lock().unwrap() = Some(result);
                    cvar.notify_one();
                };
                let lp = match EventLoop::new() {
                    Ok(lp) => lp,
                    Err(e) => {
                        send(Err(e));
                        return;
                    }
                };
                let handle = lp.handle();
                if let Some(init) = init {
                    init(&handle);
                }
                send(Ok(handle));
                lp.run();
            })?;
        self.thread = Some(thread);

        let (lock, cvar) = &*state;
        let mut published = lock.lock().unwrap();
        while published.is_none() {
            published = cvar.wait(published).unwrap();
        }
        let handle = published.take().unwrap()?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            _ = thread.join();
        }
    }
}
