//! Per-environment scheduler: work queues, run/wait status, wake dispatch.
//!
//! Four FIFO queues feed each environment: `sync_interrupts` and
//! `interrupts` (engine safe-point callbacks), `handle_tasks`
//! (reference-sensitive cleanup work), and `tasks` (normal work). Pushes
//! never dispatch by themselves; [`SchedulerLock::wake_isolate`] flips
//! Waiting→Running and hands an owning reference to either the default
//! execution context or a pool worker. Queue contents are always moved out
//! atomically ("take and swap with empty") so producers never block on a
//! draining consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::Serialize;

use crate::environment::Environment;
use crate::pool::Job;

// ── Runnable ─────────────────────────────────────────────────────────────

/// A queued unit of work, executed on whichever thread drains the queue
/// while that thread holds the environment's executor lock.
pub trait Runnable: Send {
    fn run(self: Box<Self>, env: &Arc<Environment>);
}

impl<F> Runnable for F
where
    F: FnOnce(&Arc<Environment>) + Send,
{
    fn run(self: Box<Self>, env: &Arc<Environment>) {
        (*self)(env)
    }
}

pub type Queue = VecDeque<Box<dyn Runnable>>;

// ── Status ───────────────────────────────────────────────────────────────

/// Waiting: no worker is executing this environment's queues. Running:
/// exactly one worker is draining them. Transitions happen only under the
/// scheduler mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Waiting,
    Running,
}

struct State {
    status: Status,
    tasks: Queue,
    handle_tasks: Queue,
    interrupts: Queue,
    sync_interrupts: Queue,
    async_wait: Option<Arc<WaitState>>,
}

pub struct Scheduler {
    state: Mutex<State>,
    /// Affinity hint so repeated work for this environment prefers the same
    /// pool worker.
    affinity: usize,
}

impl Scheduler {
    pub(crate) fn new(affinity: usize) -> Scheduler {
        Scheduler {
            state: Mutex::new(State {
                status: Status::Waiting,
                tasks: Queue::new(),
                handle_tasks: Queue::new(),
                interrupts: Queue::new(),
                sync_interrupts: Queue::new(),
                async_wait: None,
            }),
            affinity,
        }
    }

    /// Acquire the scheduler mutex. All queue and status access goes through
    /// the returned guard.
    pub fn lock(&self) -> SchedulerLock<'_> {
        SchedulerLock {
            scheduler: self,
            guard: self.state.lock().unwrap(),
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    /// The rendezvous currently registered by an [`AsyncWait`], reachable by
    /// threads that need to signal the waiter.
    pub fn current_wait(&self) -> Option<Arc<WaitState>> {
        self.state.lock().unwrap().async_wait.clone()
    }
}

// ── Scheduler lock ───────────────────────────────────────────────────────

pub struct SchedulerLock<'a> {
    scheduler: &'a Scheduler,
    guard: MutexGuard<'a, State>,
}

impl SchedulerLock<'_> {
    pub fn status(&self) -> Status {
        self.guard.status
    }

    pub fn push_task(&mut self, task: Box<dyn Runnable>) {
        self.guard.tasks.push_back(task);
    }

    pub fn push_handle_task(&mut self, task: Box<dyn Runnable>) {
        self.guard.handle_tasks.push_back(task);
    }

    pub fn push_interrupt(&mut self, interrupt: Box<dyn Runnable>) {
        self.guard.interrupts.push_back(interrupt);
    }

    pub fn push_sync_interrupt(&mut self, interrupt: Box<dyn Runnable>) {
        self.guard.sync_interrupts.push_back(interrupt);
    }

    pub fn take_tasks(&mut self) -> Queue {
        std::mem::take(&mut self.guard.tasks)
    }

    pub fn take_handle_tasks(&mut self) -> Queue {
        std::mem::take(&mut self.guard.handle_tasks)
    }

    pub fn take_interrupts(&mut self) -> Queue {
        std::mem::take(&mut self.guard.interrupts)
    }

    pub fn take_sync_interrupts(&mut self) -> Queue {
        std::mem::take(&mut self.guard.sync_interrupts)
    }

    /// End of an execution pass with all queues empty.
    pub fn done_running(&mut self) {
        assert_eq!(
            self.guard.status,
            Status::Running,
            "done_running called while not running"
        );
        self.guard.status = Status::Waiting;
    }

    /// Dispatch `env` for an execution pass if it is idle. Returns whether a
    /// wake occurred; `false` means a pass is already in flight and will
    /// observe the newly pushed work itself.
    pub fn wake_isolate(&mut self, env: &Arc<Environment>) -> bool {
        if self.guard.status != Status::Waiting {
            return false;
        }
        self.guard.status = Status::Running;
        // The work item owns a strong reference so the environment outlives
        // the dispatch, wherever it lands.
        let env = env.clone();
        let platform = env.platform().clone();
        let root = env.is_root();
        platform.begin_async_work();
        let job: Job = {
            let platform = platform.clone();
            Box::new(move || {
                env.async_entry();
                platform.finish_async_work();
            })
        };
        if root {
            platform.post_to_default(job);
        } else {
            platform.exec(self.scheduler.affinity, job);
        }
        true
    }

    /// Ask the engine to drain the asynchronous-interrupts queue at its next
    /// safe point, without waiting for the running script to yield.
    pub fn interrupt_isolate(&mut self, env: &Arc<Environment>) {
        assert_eq!(self.guard.status, Status::Running);
        let weak = Arc::downgrade(env);
        env.engine().request_interrupt(Box::new(move || {
            if let Some(env) = weak.upgrade() {
                env.interrupt_entry(|lock| lock.take_interrupts());
            }
        }));
    }

    /// Like [`SchedulerLock::interrupt_isolate`] but for interrupts serviced
    /// synchronously from inside an already-locked execution.
    pub fn interrupt_sync_isolate(&mut self, env: &Arc<Environment>) {
        let weak = Arc::downgrade(env);
        env.engine().request_interrupt(Box::new(move || {
            if let Some(env) = weak.upgrade() {
                env.interrupt_entry(|lock| lock.take_sync_interrupts());
            }
        }));
    }

    /// Returns false if another wait is already registered; the caller
    /// panics outside the lock so the scheduler mutex is not poisoned.
    fn register_wait(&mut self, wait: Arc<WaitState>) -> bool {
        if self.guard.async_wait.is_some() {
            return false;
        }
        self.guard.async_wait = Some(wait);
        true
    }

    fn clear_wait(&mut self) {
        self.guard.async_wait = None;
    }
}

// ── AsyncWait ────────────────────────────────────────────────────────────

#[derive(Default)]
struct WaitFlags {
    ready: bool,
    done: bool,
}

/// Shared signalling half of an [`AsyncWait`]. `ready` and `done` may be set
/// from any thread, in either order; the waiter is released only when both
/// are set.
#[derive(Default)]
pub struct WaitState {
    flags: Mutex<WaitFlags>,
    released: Condvar,
}

impl WaitState {
    /// The awaited external resource is available.
    pub fn ready(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.ready = true;
        if flags.done {
            self.released.notify_one();
        }
    }

    /// The result has been fully delivered.
    pub fn wake(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.done = true;
        if flags.ready {
            self.released.notify_one();
        }
    }

    fn wait(&self) {
        let mut flags = self.flags.lock().unwrap();
        while !flags.ready || !flags.done {
            flags = self.released.wait(flags).unwrap();
        }
    }
}

/// Rendezvous for one asynchronous readiness + completion signal pair.
/// Registers itself on the scheduler for its lifetime so other threads can
/// reach the waiter through [`Scheduler::current_wait`].
pub struct AsyncWait<'a> {
    scheduler: &'a Scheduler,
    state: Arc<WaitState>,
}

impl<'a> AsyncWait<'a> {
    /// Panics if the scheduler already has a registered wait; only one
    /// rendezvous may exist per scheduler at a time.
    pub fn new(scheduler: &'a Scheduler) -> Self {
        let state = Arc::new(WaitState::default());
        let registered = scheduler.lock().register_wait(state.clone());
        assert!(registered, "async wait already registered");
        AsyncWait { scheduler, state }
    }

    pub fn state(&self) -> Arc<WaitState> {
        self.state.clone()
    }

    pub fn ready(&self) {
        self.state.ready();
    }

    pub fn wake(&self) {
        self.state.wake();
    }

    /// Block the calling thread until both signals have arrived.
    pub fn wait(&self) {
        self.state.wait();
    }
}

impl Drop for AsyncWait<'_> {
    fn drop(&mut self) {
        self.scheduler.lock().clear_wait();
    }
}
