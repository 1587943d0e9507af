//! Executor: per-environment execution ownership and time accounting.
//!
//! [`ExecutorLock`] is the scoped guard that gives the current thread
//! exclusive ownership of an environment's engine. Acquisition installs the
//! environment as the thread's current one, attaches the wall timer,
//! acquires the engine locker, then attaches the CPU timer; release unwinds
//! in exactly the opposite order. [`ExecutorUnlock`] temporarily gives
//! ownership back (around blocking waits) without losing the outer lock's
//! bookkeeping.
//!
//! The "current environment" and "active CPU timer" chains are explicit
//! thread-local stacks of scoped guards, so timers measuring different
//! environments nest correctly on one OS thread.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::environment::Environment;

// ── Timer accumulators ───────────────────────────────────────────────────

#[derive(Default)]
struct TimerState {
    cpu_time: Duration,
    wall_time: Duration,
    cpu_started: Option<Instant>,
    wall_started: Option<Instant>,
}

pub struct Executor {
    timer: Mutex<TimerState>,
    env: OnceLock<Weak<Environment>>,
}

thread_local! {
    /// Environments currently installed on this thread, innermost last.
    static CURRENT_STACK: RefCell<Vec<Arc<Executor>>> = const { RefCell::new(Vec::new()) };
    /// CPU timers active on this thread, innermost last.
    static CPU_STACK: RefCell<Vec<Arc<Executor>>> = const { RefCell::new(Vec::new()) };
}

impl Executor {
    pub(crate) fn new() -> Arc<Executor> {
        Arc::new(Executor {
            timer: Mutex::new(TimerState::default()),
            env: OnceLock::new(),
        })
    }

    pub(crate) fn bind(&self, env: &Arc<Environment>) {
        let _ = self.env.set(Arc::downgrade(env));
    }

    /// The environment this executor belongs to, if still alive.
    pub fn environment(&self) -> Option<Arc<Environment>> {
        self.env.get().and_then(Weak::upgrade)
    }

    /// The environment installed innermost on the calling thread, if any.
    pub fn current_environment() -> Option<Arc<Environment>> {
        CURRENT_STACK.with(|stack| {
            stack.borrow().last().and_then(|executor| executor.environment())
        })
    }

    /// Accumulated CPU time, including the in-progress delta of an active
    /// timer. Computed under the timer mutex for a consistent snapshot.
    pub fn cpu_time(&self) -> Duration {
        let state = self.timer.lock().unwrap();
        state.cpu_time
            + state
                .cpu_started
                .map(|started| started.elapsed())
                .unwrap_or_default()
    }

    /// Accumulated wall time, including the in-progress delta.
    pub fn wall_time(&self) -> Duration {
        let state = self.timer.lock().unwrap();
        state.wall_time
            + state
                .wall_started
                .map(|started| started.elapsed())
                .unwrap_or_default()
    }

    // ── Timer transitions, all under the timer mutex ─────────────────────

    fn start_cpu(&self) {
        let mut state = self.timer.lock().unwrap();
        debug_assert!(state.cpu_started.is_none(), "cpu timer already active");
        state.cpu_started = Some(Instant::now());
    }

    fn pause_cpu(&self) {
        let mut state = self.timer.lock().unwrap();
        let started = state.cpu_started.take().expect("cpu timer not active");
        state.cpu_time += started.elapsed();
    }

    /// Pause the CPU timer if it is running. Returns whether it was running;
    /// the previous timer on a thread may already be paused by an
    /// [`ExecutorUnlock`] when a lock for another environment is taken.
    fn pause_cpu_if_active(&self) -> bool {
        let mut state = self.timer.lock().unwrap();
        match state.cpu_started.take() {
            Some(started) => {
                state.cpu_time += started.elapsed();
                true
            }
            None => false,
        }
    }

    fn resume_cpu(&self) {
        let mut state = self.timer.lock().unwrap();
        debug_assert!(state.cpu_started.is_none(), "cpu timer already active");
        state.cpu_started = Some(Instant::now());
    }

    /// Start the wall timer unless an earlier lock already owns it. Returns
    /// whether this caller became the owner.
    fn start_wall_if_idle(&self) -> bool {
        let mut state = self.timer.lock().unwrap();
        if state.wall_started.is_none() {
            state.wall_started = Some(Instant::now());
            true
        } else {
            false
        }
    }

    fn stop_wall(&self) {
        let mut state = self.timer.lock().unwrap();
        let started = state.wall_started.take().expect("wall timer not active");
        state.wall_time += started.elapsed();
    }
}

// ── Lock / Unlock guards ─────────────────────────────────────────────────

/// Exclusive execution ownership of one environment for the current thread.
/// Nests for the same environment across re-entrant callbacks; a thread must
/// not acquire a lock for a different environment without an intervening
/// [`ExecutorUnlock`].
pub struct ExecutorLock<'e> {
    env: &'e Environment,
    prev_cpu: Option<Arc<Executor>>,
    paused_prev: bool,
    wall_owner: bool,
}

impl<'e> ExecutorLock<'e> {
    pub fn new(env: &'e Environment) -> Self {
        let executor = env.executor();
        CURRENT_STACK.with(|stack| stack.borrow_mut().push(executor.clone()));
        // The thread's active CPU timer may belong to another environment;
        // it stays paused until this lock releases.
        let prev_cpu = CPU_STACK.with(|stack| stack.borrow().last().cloned());
        let paused_prev = match &prev_cpu {
            Some(prev) => prev.pause_cpu_if_active(),
            None => false,
        };
        let wall_owner = executor.start_wall_if_idle();
        env.engine().enter();
        CPU_STACK.with(|stack| stack.borrow_mut().push(executor.clone()));
        executor.start_cpu();
        ExecutorLock { env, prev_cpu, paused_prev, wall_owner }
    }

    pub fn environment(&self) -> &Environment {
        self.env
    }
}

impl Drop for ExecutorLock<'_> {
    fn drop(&mut self) {
        let executor = self.env.executor();
        executor.pause_cpu();
        CPU_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(popped.is_some(), "cpu timer stack underflow");
        });
        self.env.engine().exit();
        if self.wall_owner {
            executor.stop_wall();
        }
        if let Some(prev) = self.prev_cpu.take() {
            if self.paused_prev {
                prev.resume_cpu();
            }
        }
        CURRENT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(popped.is_some(), "current environment stack underflow");
        });
    }
}

/// Temporarily releases execution ownership inside an [`ExecutorLock`], for
/// the duration of a blocking wait. The CPU timer is paused so parked time
/// is not billed to the environment.
pub struct ExecutorUnlock<'l, 'e> {
    lock: &'l ExecutorLock<'e>,
}

impl<'l, 'e> ExecutorUnlock<'l, 'e> {
    pub fn new(lock: &'l ExecutorLock<'e>) -> Self {
        lock.env.executor().pause_cpu();
        lock.env.engine().exit();
        ExecutorUnlock { lock }
    }
}

impl Drop for ExecutorUnlock<'_, '_> {
    fn drop(&mut self) {
        self.lock.env.engine().enter();
        self.lock.env.executor().resume_cpu();
    }
}

/// Installs an environment as current without timers or the engine locker.
/// Used during teardown so engine destructors observe the right context.
pub(crate) struct ExecutorScope {
    _executor: Arc<Executor>,
}

impl ExecutorScope {
    pub(crate) fn new(executor: Arc<Executor>) -> Self {
        CURRENT_STACK.with(|stack| stack.borrow_mut().push(executor.clone()));
        ExecutorScope { _executor: executor }
    }
}

impl Drop for ExecutorScope {
    fn drop(&mut self) {
        CURRENT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
