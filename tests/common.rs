//! Common test utilities: a deterministic fake engine and platform fixtures.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use isolate_pool::{
    EngineFactory, EngineHooks, EngineId, Error, GcFlags, HeapStatistics, InterruptCallback,
    MemoryPressureLevel, Platform, PlatformConfig, ResourceConstraints, ScriptEngine,
};

// ── Fake engine ──────────────────────────────────────────────────────────

#[derive(Default)]
struct LockerState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Scriptable stand-in for a sandboxed engine. Heap usage is set by the
/// test; GC and near-heap-limit callbacks are fired explicitly through
/// `trigger_gc` / `trigger_near_heap_limit`; interrupts queue up until
/// `pump_interrupts` simulates a safe point.
pub struct FakeEngine {
    id: EngineId,
    locker: Mutex<LockerState>,
    locker_released: Condvar,
    hooks: Mutex<Option<Arc<dyn EngineHooks>>>,
    used_heap: AtomicUsize,
    /// Heap usage after any full collection (low-memory or critical
    /// pressure).
    gc_floor: AtomicUsize,
    heap_size_limit: AtomicUsize,
    initial_heap_size_limit: usize,
    terminated: AtomicBool,
    disposed: AtomicBool,
    interrupts: Mutex<Vec<InterruptCallback>>,
    pressure_log: Mutex<Vec<MemoryPressureLevel>>,
    restore_calls: AtomicUsize,
    microtask_runs: AtomicUsize,
    snapshot_len: AtomicUsize,
}

impl FakeEngine {
    pub fn new(heap_size_limit: usize) -> Arc<FakeEngine> {
        Arc::new(FakeEngine {
            id: EngineId::next(),
            locker: Mutex::new(LockerState::default()),
            locker_released: Condvar::new(),
            hooks: Mutex::new(None),
            used_heap: AtomicUsize::new(0),
            gc_floor: AtomicUsize::new(0),
            heap_size_limit: AtomicUsize::new(heap_size_limit),
            initial_heap_size_limit: heap_size_limit,
            terminated: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            interrupts: Mutex::new(Vec::new()),
            pressure_log: Mutex::new(Vec::new()),
            restore_calls: AtomicUsize::new(0),
            microtask_runs: AtomicUsize::new(0),
            snapshot_len: AtomicUsize::new(0),
        })
    }

    pub fn engine_id(&self) -> EngineId {
        self.id
    }

    pub fn set_used_heap(&self, bytes: usize) {
        self.used_heap.store(bytes, Ordering::SeqCst);
    }

    pub fn set_gc_floor(&self, bytes: usize) {
        self.gc_floor.store(bytes, Ordering::SeqCst);
    }

    pub fn used_heap(&self) -> usize {
        self.used_heap.load(Ordering::SeqCst)
    }

    pub fn current_heap_limit(&self) -> usize {
        self.heap_size_limit.load(Ordering::SeqCst)
    }

    pub fn initial_heap_limit(&self) -> usize {
        self.initial_heap_size_limit
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn was_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn microtask_runs(&self) -> usize {
        self.microtask_runs.load(Ordering::SeqCst)
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot_len.load(Ordering::SeqCst)
    }

    pub fn pressure_log(&self) -> Vec<MemoryPressureLevel> {
        self.pressure_log.lock().unwrap().clone()
    }

    pub fn hooks(&self) -> Arc<dyn EngineHooks> {
        self.hooks.lock().unwrap().clone().expect("hooks installed")
    }

    pub fn set_hooks(&self, hooks: Arc<dyn EngineHooks>) {
        *self.hooks.lock().unwrap() = Some(hooks);
    }

    /// Fire the mark-sweep-compact epilogue as the engine would after a GC
    /// pass.
    pub fn trigger_gc(&self, flags: GcFlags) {
        self.hooks().gc_epilogue(flags);
    }

    /// Fire the near-heap-limit callback and apply the returned limit.
    pub fn trigger_near_heap_limit(&self) {
        let current = self.current_heap_limit();
        let next = self.hooks().near_heap_limit(current);
        self.heap_size_limit.store(next, Ordering::SeqCst);
    }

    /// Run queued interrupt callbacks, simulating the engine reaching a safe
    /// point.
    pub fn pump_interrupts(&self) {
        loop {
            let drained: Vec<InterruptCallback> =
                std::mem::take(&mut *self.interrupts.lock().unwrap());
            if drained.is_empty() {
                return;
            }
            for callback in drained {
                callback();
            }
        }
    }

    fn collect_to_floor(&self) {
        let floor = self.gc_floor.load(Ordering::SeqCst);
        let used = self.used_heap.load(Ordering::SeqCst);
        if floor < used {
            self.used_heap.store(floor, Ordering::SeqCst);
        }
    }
}

/// Newtype so the environment can own the engine while the test keeps a
/// handle to script it.
pub struct EngineRef(pub Arc<FakeEngine>);

impl ScriptEngine for EngineRef {
    fn id(&self) -> EngineId {
        self.0.id
    }

    fn enter(&self) {
        let current = std::thread::current().id();
        let mut state = self.0.locker.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(current);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == current => {
                    state.depth += 1;
                    return;
                }
                Some(_) => {
                    state = self.0.locker_released.wait(state).unwrap();
                }
            }
        }
    }

    fn exit(&self) {
        let mut state = self.0.locker.lock().unwrap();
        assert_eq!(state.owner, Some(std::thread::current().id()));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.0.locker_released.notify_all();
        }
    }

    fn terminate_execution(&self) {
        self.0.terminated.store(true, Ordering::SeqCst);
    }

    fn request_interrupt(&self, callback: InterruptCallback) {
        self.0.interrupts.lock().unwrap().push(callback);
    }

    fn heap_statistics(&self) -> HeapStatistics {
        HeapStatistics {
            used_heap_size: self.0.used_heap.load(Ordering::SeqCst),
            total_heap_size: self.0.used_heap.load(Ordering::SeqCst),
            heap_size_limit: self.0.heap_size_limit.load(Ordering::SeqCst),
            malloced_memory: 0,
            peak_malloced_memory: 0,
            externally_allocated: 0,
        }
    }

    fn low_memory_notification(&self) {
        self.0.collect_to_floor();
    }

    fn memory_pressure_notification(&self, level: MemoryPressureLevel) {
        self.0.pressure_log.lock().unwrap().push(level);
        if level == MemoryPressureLevel::Critical {
            self.0.collect_to_floor();
        }
    }

    fn run_microtasks(&self) {
        self.0.microtask_runs.fetch_add(1, Ordering::SeqCst);
    }

    fn restore_heap_limit(&self) {
        self.0.restore_calls.fetch_add(1, Ordering::SeqCst);
        self.0
            .heap_size_limit
            .store(self.0.initial_heap_size_limit, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.0.disposed.store(true, Ordering::SeqCst);
    }
}

// ── Fake factory ─────────────────────────────────────────────────────────

/// Builds fake engines whose heap-size limit is the requested old-space
/// budget plus a fixed bookkeeping overhead, mirroring how a real engine
/// reports a heap limit above the requested old space.
pub struct FakeFactory {
    pub heap_overhead: usize,
    pub fail: bool,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeFactory {
    pub fn new(heap_overhead: usize) -> FakeFactory {
        FakeFactory {
            heap_overhead,
            fail: false,
            engines: Mutex::new(Vec::new()),
        }
    }

    /// The most recently created engine.
    pub fn last_engine(&self) -> Arc<FakeEngine> {
        self.engines
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("factory created an engine")
    }
}

impl EngineFactory for FakeFactory {
    fn create(
        &self,
        constraints: &ResourceConstraints,
        snapshot: Option<&[u8]>,
        hooks: Arc<dyn EngineHooks>,
    ) -> isolate_pool::Result<Box<dyn ScriptEngine>> {
        if self.fail {
            return Err(Error::EngineCreation("factory configured to fail".into()));
        }
        let limit = constraints.max_old_space_size_mb * 1024 * 1024 + self.heap_overhead;
        let engine = FakeEngine::new(limit);
        engine.set_hooks(hooks);
        if let Some(payload) = snapshot {
            engine.snapshot_len.store(payload.len(), Ordering::SeqCst);
        }
        self.engines.lock().unwrap().push(engine.clone());
        Ok(Box::new(EngineRef(engine)))
    }
}

// ── Platform fixtures ────────────────────────────────────────────────────

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// A platform with a small worker pool, created on the calling thread (which
/// becomes the default thread).
pub fn test_platform() -> Arc<Platform> {
    init_tracing();
    Platform::new(PlatformConfig { pool_size: 2 })
}

/// Poll `predicate` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

/// Wait for every dispatched unit of work to finish.
pub fn drain_async_work(platform: &Platform) {
    assert!(
        wait_until(Duration::from_secs(5), || {
            platform.outstanding_async_work() == 0
        }),
        "outstanding async work did not drain"
    );
}
