//! Process-wide services shared by every environment.
//!
//! A [`Platform`] bundles the fixed worker pool, the bookkeeping registry,
//! the outstanding-async-work counter, and the default execution context's
//! event queue. It is created once, on the thread that will act as the
//! default execution context, and injected into environments rather than
//! reached through ambient globals, so tests construct isolated instances.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use serde::Deserialize;

use crate::pool::{Job, ThreadPool};
use crate::registry::Registry;

/// Default worker count: one worker per hardware thread, plus one.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        + 1
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Number of pool workers shared by all sandboxed environments.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig { pool_size: default_pool_size() }
    }
}

/// Queue and wakeup state of the default execution context's loop.
struct LoopShared {
    queue: Mutex<VecDeque<Job>>,
    wakeup: Condvar,
}

pub struct Platform {
    pool: ThreadPool,
    registry: Registry,
    /// Work dispatched but not yet completed, process-wide. While non-zero
    /// the default loop stays referenced (alive); the transition to zero
    /// wakes the default thread so it can observe the unref itself.
    async_refs: AtomicUsize,
    default_thread: ThreadId,
    loop_shared: LoopShared,
    next_affinity: AtomicUsize,
}

impl Platform {
    /// Build the platform. Must be called on the thread that owns the
    /// default execution context; that thread's identity is recorded for
    /// [`Platform::is_default_thread`].
    pub fn new(config: PlatformConfig) -> Arc<Platform> {
        Arc::new(Platform {
            pool: ThreadPool::new(config.pool_size),
            registry: Registry::new(),
            async_refs: AtomicUsize::new(0),
            default_thread: std::thread::current().id(),
            loop_shared: LoopShared {
                queue: Mutex::new(VecDeque::new()),
                wakeup: Condvar::new(),
            },
            next_affinity: AtomicUsize::new(0),
        })
    }

    /// True only on the thread that created this platform.
    pub fn is_default_thread(&self) -> bool {
        std::thread::current().id() == self.default_thread
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Affinity hint for a newly created scheduler.
    pub(crate) fn next_affinity(&self) -> usize {
        self.next_affinity.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `job` on the shared pool.
    pub(crate) fn exec(&self, affinity: usize, job: Job) {
        self.pool.exec(affinity, job);
    }

    /// Send `job` to the default execution context from any thread.
    pub(crate) fn post_to_default(&self, job: Job) {
        self.loop_shared.queue.lock().unwrap().push_back(job);
        self.loop_shared.wakeup.notify_one();
    }

    /// Account one dispatched unit of work.
    pub(crate) fn begin_async_work(&self) {
        self.async_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Complete one dispatched unit of work. When the count reaches zero
    /// from a non-default thread, the default thread is woken once so the
    /// loop can unreference itself on its owning thread.
    pub(crate) fn finish_async_work(&self) {
        if self.async_refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            // The queue mutex orders this notify against the loop's
            // check-then-park; a notify outside it can land in the gap and
            // be lost.
            let _queue = self.loop_shared.queue.lock().unwrap();
            self.loop_shared.wakeup.notify_one();
        }
    }

    /// Outstanding dispatched work, process-wide.
    pub fn outstanding_async_work(&self) -> usize {
        self.async_refs.load(Ordering::SeqCst)
    }

    /// Run the default execution context's loop on the current thread.
    /// Processes posted jobs and returns once the queue is empty and no
    /// async work is outstanding anywhere in the process.
    pub fn run_default_loop(&self) {
        assert!(
            self.is_default_thread(),
            "default loop must run on the thread that created the platform"
        );
        loop {
            let job = {
                let mut queue = self.loop_shared.queue.lock().unwrap();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if self.async_refs.load(Ordering::SeqCst) == 0 {
                        break None;
                    }
                    queue = self.loop_shared.wakeup.wait(queue).unwrap();
                }
            };
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }
}
