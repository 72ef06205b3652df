use crate::event_loop::LoopHandle;
use crate::event_loop_thread::EventLoopThread;
use std::cell::Cell;
use std::sync::Arc;

/// A fixed set of loop threads fronted by a base loop, with round-robin and
/// hashed distribution. With zero workers every request routes back to the
/// base loop, so callers never special-case the single-threaded setup.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    threads: Vec<EventLoopThread>,
    handles: Vec<LoopHandle>,
    next: Cell<usize>,
}

impl std::fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("started", &self.started)
            .field("threads", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl EventLoopThreadPool {
    /// A pool with a generated name, fronted by `base`.
    #[must_use]
    pub fn new(base: LoopHandle) -> EventLoopThreadPool {
        EventLoopThreadPool::with_name(base, format!("loop-pool-{}", uuid::Uuid::new_v4()))
    }

    /// A pool named `name`, fronted by `base`. Worker threads are named
    /// after the pool.
    #[must_use]
    pub fn with_name(base: LoopHandle, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name,
            started: false,
            threads: Vec::new(),
            handles: Vec::new(),
            next: Cell::new(0),
        }
    }

    /// Whether [`EventLoopThreadPool::start`] already ran.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started
    }

    /// Spawns `num_threads` loop threads, pinning them to distinct cores
    /// where the platform exposes core ids.
    ///
    /// # Errors
    /// if any worker thread or its loop cannot be created.
    ///
    /// # Panics
    /// if the pool was already started.
    pub fn start(&mut self, num_threads: usize) -> std::io::Result<()> {
        self.do_start(num_threads, None)
    }

    /// Like [`EventLoopThreadPool::start`], with `init` run on each worker
    /// thread once its loop exists, before any task can reach it.
    ///
    /// # Errors
    /// if any worker thread or its loop cannot be created.
    ///
    /// # Panics
    /// if the pool was already started.
    pub fn start_with_init(
        &mut self,
        num_threads: usize,
        init: impl Fn(&LoopHandle) + Send + Sync + 'static,
    ) -> std::io::Result<()> {
        self.do_start(num_threads, Some(Arc::new(init)))
    }

    fn do_start(
        &mut self,
        num_threads: usize,
        init: Option<Arc<dyn Fn(&LoopHandle) + Send + Sync>>,
    ) -> std::io::Result<()> {
        assert!(!self.started, "pool {} already started", self.name);
        self.base.assert_in_loop_thread();
        let cores = core_affinity::get_core_ids().unwrap_or_default();
        for i in 0..num_threads {
            let mut thread = EventLoopThread::with_name(format!("{}-{i}", self.name));
            if let Some(core) = cores.get(i % cores.len().max(1)) {
                thread.pin_to(*core);
            }
            if let Some(init) = &init {
                let init = init.clone();
                thread.set_init(move |handle| init(handle));
            }
            let handle = thread.start_loop()?;
            self.threads.push(thread);
            self.handles.push(handle);
        }
        self.started = true;
        crate::debug!("pool {} started {} loop threads", self.name, num_threads);
        Ok(())
    }

    /// The next loop in round-robin order, or the base loop for an empty
    /// pool. Called from the base loop's thread only, so distribution state
    /// needs no lock.
    #[must_use]
    pub fn next_loop(&self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let index = self.next.get();
        self.next.set((index + 1) % self.handles.len());
        self.handles[index].clone()
    }

    /// A stable loop for `key`: equal keys always land on the same loop.
    #[must_use]
    pub fn loop_for_hash(&self, key: u64) -> LoopHandle {
        self.base.assert_in_loop_thread();
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let index = usize::try_from(key % self.handles.len() as u64).unwrap_or(0);
        self.handles[index].clone()
    }

    /// Every worker loop, or just the base loop for an empty pool.
    #[must_use]
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.handles.is_empty() {
            vec![self.base.clone()]
        } else {
            self.handles.clone()
        }
    }
}
