//! Environment: one sandboxed (or the single privileged root) execution
//! context with its own resource limits.
//!
//! An environment owns its engine instance, its scheduler, and its executor.
//! The root environment binds to the host's pre-existing engine on the
//! default thread and is never torn down; sandboxed environments are created
//! with an explicit memory limit (and optionally an enveloped snapshot blob)
//! and enforce that limit proactively: the engine is terminated before the
//! allocator can abort the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{
    EngineFactory, EngineHooks, GcFlags, HeapStatistics, MemoryPressureLevel, ResourceConstraints,
    ScriptEngine,
};
use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorLock, ExecutorScope};
use crate::platform::Platform;
use crate::scheduler::{Queue, Scheduler, SchedulerLock};
use crate::snapshot;

// ── Configuration ────────────────────────────────────────────────────────

/// Default memory limit for a sandboxed environment, in megabytes.
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 128;

/// Extra allowance temporarily granted by the near-heap-limit callback to
/// avoid a hard crash while pressure notifications do their work.
const HEAP_LIMIT_GRACE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentOptions {
    /// User-heap budget in megabytes. Engine bookkeeping overhead is
    /// measured at construction and tracked separately.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    /// Enveloped snapshot blob to boot the engine from (see
    /// [`crate::snapshot`]).
    #[serde(default)]
    pub snapshot: Option<Vec<u8>>,
}

fn default_memory_limit_mb() -> usize {
    DEFAULT_MEMORY_LIMIT_MB
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        EnvironmentOptions {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            snapshot: None,
        }
    }
}

// ── Supporting types ─────────────────────────────────────────────────────

/// Identifies one weak reference registered with
/// [`Environment::add_weak_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle(pub u64);

type WeakCallback = Box<dyn FnOnce() + Send>;

/// Debug/inspector agent attached to an environment. Stopped on terminate
/// and dropped during teardown.
pub trait DebugAgent: Send {
    fn terminate(&mut self);
}

/// The owning handle for an environment ("holder"). Releasing the last
/// strong reference to the [`Environment`] inside triggers teardown;
/// operations through a released handle fail with [`Error::Disposed`]
/// rather than hang.
pub struct EnvironmentHandle {
    env: Mutex<Option<Arc<Environment>>>,
}

impl EnvironmentHandle {
    fn new(env: Arc<Environment>) -> Arc<EnvironmentHandle> {
        Arc::new(EnvironmentHandle {
            env: Mutex::new(Some(env)),
        })
    }

    pub fn environment(&self) -> Result<Arc<Environment>> {
        self.env.lock().unwrap().clone().ok_or(Error::Disposed)
    }

    /// Drop the holder's strong reference. Returns it so a caller can
    /// control where the potential final release (and teardown) happens.
    pub fn release(&self) -> Option<Arc<Environment>> {
        self.env.lock().unwrap().take()
    }
}

// ── Memory pressure encoding for atomic storage ──────────────────────────

const PRESSURE_NONE: u8 = 0;
const PRESSURE_MODERATE: u8 = 1;
const PRESSURE_CRITICAL: u8 = 2;

fn pressure_to_u8(level: MemoryPressureLevel) -> u8 {
    match level {
        MemoryPressureLevel::None => PRESSURE_NONE,
        MemoryPressureLevel::Moderate => PRESSURE_MODERATE,
        MemoryPressureLevel::Critical => PRESSURE_CRITICAL,
    }
}

fn pressure_from_u8(raw: u8) -> MemoryPressureLevel {
    match raw {
        PRESSURE_MODERATE => MemoryPressureLevel::Moderate,
        PRESSURE_CRITICAL => MemoryPressureLevel::Critical,
        _ => MemoryPressureLevel::None,
    }
}

// ── Environment ──────────────────────────────────────────────────────────

pub struct Environment {
    platform: Arc<Platform>,
    engine: Box<dyn ScriptEngine>,
    scheduler: Scheduler,
    executor: Arc<Executor>,
    self_weak: OnceLock<Weak<Environment>>,
    handle: OnceLock<Weak<EnvironmentHandle>>,
    root: bool,
    memory_limit: usize,
    initial_heap_size_limit: usize,
    misc_memory_size: usize,
    extra_allocated: AtomicUsize,
    terminated: AtomicBool,
    hit_memory_limit: AtomicBool,
    did_adjust_heap_limit: AtomicBool,
    memory_pressure: AtomicU8,
    rejected_promise: Mutex<Option<String>>,
    weak_callbacks: Mutex<HashMap<WeakHandle, WeakCallback>>,
    debug_agent: Mutex<Option<Box<dyn DebugAgent>>>,
}

/// Adapter handing engine callbacks to the owning environment. The weak
/// back-reference is bound right after the environment is wrapped in an
/// `Arc`; callbacks that fire before then are dropped.
struct Hooks {
    env: Mutex<Weak<Environment>>,
}

impl Hooks {
    fn new() -> Arc<Hooks> {
        Arc::new(Hooks {
            env: Mutex::new(Weak::new()),
        })
    }

    fn bind(&self, env: &Arc<Environment>) {
        *self.env.lock().unwrap() = Arc::downgrade(env);
    }

    fn get(&self) -> Option<Arc<Environment>> {
        self.env.lock().unwrap().upgrade()
    }
}

impl EngineHooks for Hooks {
    fn gc_epilogue(&self, flags: GcFlags) {
        if let Some(env) = self.get() {
            env.gc_epilogue(flags);
        }
    }

    fn near_heap_limit(&self, current_limit: usize) -> usize {
        match self.get() {
            Some(env) => env.near_heap_limit(current_limit),
            None => current_limit,
        }
    }

    fn promise_rejected(&self, message: String) {
        if let Some(env) = self.get() {
            *env.rejected_promise.lock().unwrap() = Some(message);
        }
    }

    fn oom(&self, location: &str, stats: &HeapStatistics) -> ! {
        crate::engine::dump_heap_statistics(location, stats);
        std::process::abort()
    }
}

impl Environment {
    /// Bind the root environment to an already-running, privileged engine
    /// instance. Must be called on the default thread, once, at process
    /// start. The root environment has no memory limit of its own and never
    /// tears down.
    pub fn root(platform: &Arc<Platform>, engine: Box<dyn ScriptEngine>) -> Arc<EnvironmentHandle> {
        assert!(
            platform.is_default_thread(),
            "root environment must be constructed on the default thread"
        );
        let engine_id = engine.id();
        let env = Arc::new(Environment {
            platform: platform.clone(),
            engine,
            scheduler: Scheduler::new(0),
            executor: Executor::new(),
            self_weak: OnceLock::new(),
            handle: OnceLock::new(),
            root: true,
            memory_limit: usize::MAX,
            initial_heap_size_limit: 0,
            misc_memory_size: 0,
            extra_allocated: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            hit_memory_limit: AtomicBool::new(false),
            did_adjust_heap_limit: AtomicBool::new(false),
            memory_pressure: AtomicU8::new(PRESSURE_NONE),
            rejected_promise: Mutex::new(None),
            weak_callbacks: Mutex::new(HashMap::new()),
            debug_agent: Mutex::new(None),
        });
        let _ = env.self_weak.set(Arc::downgrade(&env));
        env.executor.bind(&env);
        let handle = EnvironmentHandle::new(env.clone());
        let _ = env.handle.set(Arc::downgrade(&handle));
        platform.registry().insert(engine_id, &handle);
        tracing::debug!(engine = ?engine_id, "root environment bound");
        handle
    }

    /// Create a sandboxed environment with its own engine instance, memory
    /// limit, and optionally an enveloped snapshot blob to boot from.
    pub fn new(
        platform: &Arc<Platform>,
        options: EnvironmentOptions,
        factory: &dyn EngineFactory,
    ) -> Result<Arc<EnvironmentHandle>> {
        let memory_limit = options.memory_limit_mb * 1024 * 1024;
        let payload = match &options.snapshot {
            Some(blob) => Some(snapshot::unwrap(blob)?),
            None => None,
        };
        let constraints = ResourceConstraints::from_memory_limit_mb(options.memory_limit_mb);
        let hooks = Hooks::new();
        let engine = factory.create(&constraints, payload.as_deref(), hooks.clone())?;
        let engine_id = engine.id();

        // Heap statistics crush many memory spaces into one number; the gap
        // between the requested limit and the engine's calculated heap size
        // is bookkeeping overhead, tracked separately from the user budget.
        let stats = engine.heap_statistics();
        let initial_heap_size_limit = stats.heap_size_limit;
        let misc_memory_size = stats.heap_size_limit.saturating_sub(memory_limit);

        let env = Arc::new(Environment {
            platform: platform.clone(),
            engine,
            scheduler: Scheduler::new(platform.next_affinity()),
            executor: Executor::new(),
            self_weak: OnceLock::new(),
            handle: OnceLock::new(),
            root: false,
            memory_limit,
            initial_heap_size_limit,
            misc_memory_size,
            extra_allocated: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            hit_memory_limit: AtomicBool::new(false),
            did_adjust_heap_limit: AtomicBool::new(false),
            memory_pressure: AtomicU8::new(PRESSURE_NONE),
            rejected_promise: Mutex::new(None),
            weak_callbacks: Mutex::new(HashMap::new()),
            debug_agent: Mutex::new(None),
        });
        let _ = env.self_weak.set(Arc::downgrade(&env));
        env.executor.bind(&env);
        hooks.bind(&env);
        let handle = EnvironmentHandle::new(env.clone());
        let _ = env.handle.set(Arc::downgrade(&handle));
        platform.registry().insert(engine_id, &handle);
        tracing::debug!(
            engine = ?engine_id,
            memory_limit_mb = options.memory_limit_mb,
            "sandboxed environment created"
        );
        Ok(handle)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn engine(&self) -> &dyn ScriptEngine {
        self.engine.as_ref()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn hit_memory_limit(&self) -> bool {
        self.hit_memory_limit.load(Ordering::SeqCst)
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn extra_allocated_memory(&self) -> usize {
        self.extra_allocated.load(Ordering::SeqCst)
    }

    /// Track allocations living outside the engine heap (external buffers).
    /// The counter saturates at zero; an over-release must not wrap into a
    /// spurious memory-limit hit.
    pub fn adjust_extra_allocated_memory(&self, delta: isize) {
        if delta >= 0 {
            self.extra_allocated.fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            let release = delta.unsigned_abs();
            let _ = self.extra_allocated.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |current| Some(current.saturating_sub(release)),
            );
        }
    }

    pub fn cpu_time(&self) -> Duration {
        self.executor.cpu_time()
    }

    pub fn wall_time(&self) -> Duration {
        self.executor.wall_time()
    }

    fn weak(&self) -> Weak<Environment> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Attach a debug agent. Replaces any existing one.
    pub fn attach_debug_agent(&self, agent: Box<dyn DebugAgent>) {
        *self.debug_agent.lock().unwrap() = Some(agent);
    }

    /// Terminate this environment: stop the attached debug agent, forcibly
    /// end in-flight execution, and release the holder's strong reference.
    /// Queued work that runs after this observes `terminated` and no-ops.
    ///
    /// Panics if called on the root environment.
    pub fn terminate(&self) {
        assert!(!self.root, "cannot terminate the root environment");
        self.terminated.store(true, Ordering::SeqCst);
        {
            let _scheduler = self.scheduler.lock();
            if let Some(mut agent) = self.debug_agent.lock().unwrap().take() {
                agent.terminate();
            }
        }
        self.engine.terminate_execution();
        if let Some(handle) = self.handle.get().and_then(Weak::upgrade) {
            handle.release();
        }
        tracing::debug!(engine = ?self.engine.id(), "environment terminated");
    }

    /// Register a cleanup invoked when the engine collects `handle`, or at
    /// teardown if the handle is still live then. No-op on the root
    /// environment. Panics on duplicate registration.
    pub fn add_weak_callback(
        &self,
        handle: WeakHandle,
        callback: impl FnOnce() + Send + 'static,
    ) {
        if self.root {
            return;
        }
        let mut callbacks = self.weak_callbacks.lock().unwrap();
        if callbacks.contains_key(&handle) {
            // Release the guard first; a panic while holding it would
            // poison the table teardown still has to drain.
            drop(callbacks);
            panic!("weak callback already added");
        }
        callbacks.insert(handle, Box::new(callback));
    }

    /// Unregister a weak callback. No-op on the root environment. Panics if
    /// the handle was never registered.
    pub fn remove_weak_callback(&self, handle: WeakHandle) {
        if self.root {
            return;
        }
        let removed = self.weak_callbacks.lock().unwrap().remove(&handle);
        assert!(removed.is_some(), "weak callback doesn't exist");
    }

    // ── Memory enforcement ───────────────────────────────────────────────

    /// Begin a heap check bracketing an operation that may allocate. Call
    /// [`HeapCheck::epilogue`] when the operation finishes.
    pub fn heap_check(&self, force: bool) -> HeapCheck<'_> {
        HeapCheck {
            env: self,
            extra_size_before: self.extra_allocated_memory(),
            force,
        }
    }

    /// Mark-sweep-compact epilogue: enforce the limit after a full pass,
    /// escalate pressure to force one, or ratchet an expanded heap limit
    /// back down while usage is comfortably under budget.
    pub(crate) fn gc_epilogue(&self, flags: GcFlags) {
        let stats = self.engine.heap_statistics();
        let total_memory = stats.used_heap_size + self.extra_allocated_memory();
        let memory_limit = self.memory_limit + self.misc_memory_size;
        if total_memory > memory_limit {
            if flags.collect_all || flags.forced {
                self.hit_memory_limit.store(true, Ordering::SeqCst);
                self.terminate();
            } else {
                // Force a full collection before giving up on the isolate.
                self.request_memory_pressure(MemoryPressureLevel::Critical, true, false);
            }
        } else if !flags.collect_all {
            if self.did_adjust_heap_limit.load(Ordering::SeqCst) {
                self.engine.restore_heap_limit();
                let stats = self.engine.heap_statistics();
                if stats.heap_size_limit == self.initial_heap_size_limit {
                    self.did_adjust_heap_limit.store(false, Ordering::SeqCst);
                }
            }
            if total_memory + total_memory / 4 > memory_limit {
                // Send "moderate" pressure at 80%
                self.request_memory_pressure(MemoryPressureLevel::Moderate, true, false);
            }
        }
    }

    /// Near-heap-limit callback: grant temporary headroom instead of letting
    /// the allocator abort, and raise pressure so the next epilogue decides
    /// whether to retract the grant.
    pub(crate) fn near_heap_limit(&self, current_limit: usize) -> usize {
        self.did_adjust_heap_limit.store(true, Ordering::SeqCst);
        let stats = self.engine.heap_statistics();
        let level = if stats.used_heap_size + self.extra_allocated_memory()
            > self.memory_limit + self.misc_memory_size
        {
            MemoryPressureLevel::Critical
        } else {
            MemoryPressureLevel::Moderate
        };
        self.request_memory_pressure(level, true, true);
        tracing::warn!(
            engine = ?self.engine.id(),
            current_limit,
            "near heap limit, granting temporary allowance"
        );
        current_limit + HEAP_LIMIT_GRACE
    }

    fn request_memory_pressure(
        &self,
        level: MemoryPressureLevel,
        is_reentrant_gc: bool,
        as_interrupt: bool,
    ) {
        if as_interrupt {
            self.memory_pressure
                .store(pressure_to_u8(level), Ordering::SeqCst);
            let weak = self.weak();
            self.engine.request_interrupt(Box::new(move || {
                if let Some(env) = weak.upgrade() {
                    env.check_memory_pressure();
                }
            }));
        } else {
            self.memory_pressure.store(PRESSURE_NONE, Ordering::SeqCst);
            self.engine.memory_pressure_notification(level);
            if is_reentrant_gc && level == MemoryPressureLevel::Critical {
                // Reentrant collection doesn't re-trigger engine callbacks.
                self.gc_epilogue(GcFlags::FORCED);
            }
        }
    }

    /// Deliver a pending pressure notification, if one was deferred to a
    /// safe point. Cheap when there is nothing pending.
    pub fn check_memory_pressure(&self) {
        let raw = self.memory_pressure.swap(PRESSURE_NONE, Ordering::SeqCst);
        let level = pressure_from_u8(raw);
        if level != MemoryPressureLevel::None {
            self.engine.memory_pressure_notification(level);
        }
    }

    /// Epilogue common to every queued task: run microtasks, deliver any
    /// deferred pressure notification, then surface memory-limit hits,
    /// termination, and unhandled promise rejections as the task's failure.
    pub fn task_epilogue(&self) -> Result<()> {
        self.engine.run_microtasks();
        self.check_memory_pressure();
        if self.hit_memory_limit() {
            return Err(Error::MemoryLimit);
        }
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        if let Some(message) = self.rejected_promise.lock().unwrap().take() {
            return Err(Error::Runtime(message));
        }
        Ok(())
    }

    // ── Execution passes ─────────────────────────────────────────────────

    /// One execution pass: drain and run all queues until empty, then flip
    /// back to Waiting. Runs on whichever thread picked up the wake, under
    /// the executor lock for this environment.
    pub(crate) fn async_entry(self: &Arc<Self>) {
        let _lock = ExecutorLock::new(self);
        loop {
            let mut sync_interrupts;
            let mut interrupts;
            let mut handle_tasks;
            let mut tasks;
            {
                let mut scheduler = self.scheduler.lock();
                sync_interrupts = scheduler.take_sync_interrupts();
                interrupts = scheduler.take_interrupts();
                handle_tasks = scheduler.take_handle_tasks();
                tasks = scheduler.take_tasks();
                if sync_interrupts.is_empty()
                    && interrupts.is_empty()
                    && handle_tasks.is_empty()
                    && tasks.is_empty()
                {
                    scheduler.done_running();
                    return;
                }
            }

            for interrupt in sync_interrupts.drain(..) {
                interrupt.run(self);
            }
            for interrupt in interrupts.drain(..) {
                interrupt.run(self);
            }
            for task in handle_tasks.drain(..) {
                task.run(self);
            }
            for task in tasks.drain(..) {
                // A task queued before termination no-ops after it.
                if self.is_terminated() {
                    continue;
                }
                task.run(self);
                if self.hit_memory_limit() {
                    return;
                }
                self.check_memory_pressure();
            }
        }
    }

    /// Drain one interrupt queue from inside an already-locked execution.
    /// `take` selects which queue to swap out under the scheduler lock.
    pub(crate) fn interrupt_entry(
        self: &Arc<Self>,
        take: impl Fn(&mut SchedulerLock<'_>) -> Queue,
    ) {
        loop {
            let mut interrupts = {
                let mut scheduler = self.scheduler.lock();
                take(&mut scheduler)
            };
            if interrupts.is_empty() {
                return;
            }
            for interrupt in interrupts.drain(..) {
                interrupt.run(self);
            }
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        // The root environment is a process-lifetime singleton.
        if self.root {
            return;
        }
        {
            // Detach the debug agent under the scheduler lock, then finish
            // it off while holding execution ownership.
            let agent = {
                let _scheduler = self.scheduler.lock();
                self.debug_agent.lock().unwrap().take()
            };
            let _lock = ExecutorLock::new(self);
            drop(agent);

            // Invoke every registered weak-reference cleanup. The table must
            // end empty; a cleanup registering new callbacks is a bug.
            // Teardown may run while unwinding from a registration panic, so
            // tolerate a poisoned table rather than aborting in a destructor.
            let callbacks: Vec<(WeakHandle, WeakCallback)> = self
                .weak_callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .collect();
            for (_, callback) in callbacks {
                callback();
            }
            assert!(
                self.weak_callbacks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_empty(),
                "weak callbacks registered during teardown"
            );

            // Destroy outstanding work while execution ownership is held.
            let mut scheduler = self.scheduler.lock();
            scheduler.take_interrupts();
            scheduler.take_sync_interrupts();
            scheduler.take_handle_tasks();
            scheduler.take_tasks();
        }
        {
            // Engine destructors run with this environment installed as
            // current.
            let _scope = ExecutorScope::new(self.executor.clone());
            self.engine.dispose();
        }
        self.platform.registry().remove(self.engine.id());
        tracing::debug!(engine = ?self.engine.id(), "environment disposed");
    }
}

// ── HeapCheck ────────────────────────────────────────────────────────────

/// Brackets an operation that may allocate. On epilogue, if the environment
/// is over budget even after a best-effort collection, it is terminated and
/// the operation fails with [`Error::MemoryLimit`].
pub struct HeapCheck<'e> {
    env: &'e Environment,
    extra_size_before: usize,
    force: bool,
}

impl HeapCheck<'_> {
    pub fn epilogue(&self) -> Result<()> {
        let env = self.env;
        if env.root {
            return Ok(());
        }
        if !self.force && env.extra_allocated_memory() == self.extra_size_before {
            return Ok(());
        }
        let stats = env.engine.heap_statistics();
        if stats.used_heap_size + env.extra_allocated_memory() > env.memory_limit {
            env.engine.low_memory_notification();
            let stats = env.engine.heap_statistics();
            if stats.used_heap_size + env.extra_allocated_memory() > env.memory_limit {
                env.hit_memory_limit.store(true, Ordering::SeqCst);
                env.terminate();
                tracing::warn!(
                    engine = ?env.engine.id(),
                    used_heap = stats.used_heap_size,
                    extra = env.extra_allocated_memory(),
                    limit = env.memory_limit,
                    "memory limit exceeded, terminating"
                );
                return Err(Error::MemoryLimit);
            }
        }
        Ok(())
    }
}
