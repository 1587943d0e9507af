//! Fixed-size worker pool with thread-affinity hints.
//!
//! Workers each own a private queue; a work item tagged with an affinity
//! hint always lands on `affinity % workers`, so repeated work for the same
//! environment prefers the same OS thread and keeps its engine state warm in
//! cache. This is deliberately not a general-purpose pool; it exists to be
//! consumed by the scheduler.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

/// A unit of pool work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    senders: Vec<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `size` workers. Panics if `size` is zero or a worker thread
    /// cannot be spawned.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool requires at least one worker");
        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let (tx, rx) = mpsc::channel::<Job>();
            let handle = std::thread::Builder::new()
                .name(format!("isolate-pool-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn pool worker");
            senders.push(tx);
            workers.push(handle);
        }
        ThreadPool { senders, workers }
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    /// Queue `job` on the worker selected by `affinity`.
    pub fn exec(&self, affinity: usize, job: Job) {
        let index = affinity % self.senders.len();
        if self.senders[index].send(job).is_err() {
            // Only reachable once the pool is shutting down.
            tracing::warn!(worker = index, "dropped job sent to stopped worker");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channels stops the workers once their queues drain.
        self.senders.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
