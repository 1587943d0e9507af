//! Seam to the sandboxed script engine.
//!
//! The engine itself (compilation, execution, garbage collection) is an
//! external collaborator consumed as an opaque capability. This module
//! defines the narrow surface the scheduler and environment need from it:
//! exclusive execution ownership, termination, safe-point interrupts, heap
//! statistics, and memory-pressure notifications, plus the hook points the
//! engine fires back into its owning environment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;

// ── Identity ─────────────────────────────────────────────────────────────

/// Opaque identity of one engine instance, used by the bookkeeping registry
/// to recover the owning environment from engine-level callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EngineId(u64);

impl EngineId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        EngineId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ── Heap statistics and pressure ─────────────────────────────────────────

/// Snapshot of the engine's heap, as reported by the engine. These are the
/// fields dumped on an unrecoverable allocator-level OOM.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HeapStatistics {
    pub used_heap_size: usize,
    pub total_heap_size: usize,
    pub heap_size_limit: usize,
    pub malloced_memory: usize,
    pub peak_malloced_memory: usize,
    pub externally_allocated: usize,
}

/// Tri-state hint signaling how aggressively the engine should reclaim
/// memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressureLevel {
    None,
    Moderate,
    Critical,
}

/// Flags describing a completed mark-sweep-compact garbage collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcFlags {
    /// The pass was explicitly forced rather than heuristically scheduled.
    pub forced: bool,
    /// The pass collected all available garbage (a full, last-resort pass).
    pub collect_all: bool,
}

impl GcFlags {
    pub const NORMAL: GcFlags = GcFlags { forced: false, collect_all: false };
    pub const FORCED: GcFlags = GcFlags { forced: true, collect_all: false };
    pub const COLLECT_ALL: GcFlags = GcFlags { forced: true, collect_all: true };
}

// ── Engine capability ────────────────────────────────────────────────────

/// Callback invoked by the engine at its next safe point, on the thread
/// currently running script for this engine.
pub type InterruptCallback = Box<dyn FnOnce() + Send + 'static>;

/// The capability surface consumed from one sandboxed engine instance.
///
/// `enter`/`exit` bracket exclusive execution ownership (the engine's
/// "locker"); re-entrant acquisition from the owning thread must succeed.
/// `terminate_execution` and `request_interrupt` are callable from any
/// thread without holding ownership.
pub trait ScriptEngine: Send + Sync {
    fn id(&self) -> EngineId;

    /// Acquire exclusive execution ownership, blocking until available.
    fn enter(&self);

    /// Release execution ownership acquired by the matching `enter`.
    fn exit(&self);

    /// Forcibly terminate in-flight execution. Thread-safe.
    fn terminate_execution(&self);

    /// Ask the engine to invoke `callback` at its next safe point.
    /// Thread-safe.
    fn request_interrupt(&self, callback: InterruptCallback);

    fn heap_statistics(&self) -> HeapStatistics;

    /// Request an immediate best-effort collection.
    fn low_memory_notification(&self);

    fn memory_pressure_notification(&self, level: MemoryPressureLevel);

    /// Run microtasks queued by the last executed script.
    fn run_microtasks(&self);

    /// Retract a near-heap-limit grant, ratcheting the heap limit back
    /// toward its initial value.
    fn restore_heap_limit(&self);

    /// Tear down the engine instance. Called exactly once, with the owning
    /// environment installed as current.
    fn dispose(&self);
}

// ── Hooks fired by the engine into its environment ───────────────────────

/// Callbacks a sandboxed engine fires into its owning environment. Installed
/// at engine creation; every method may be invoked from whichever thread the
/// engine happens to be running on.
pub trait EngineHooks: Send + Sync {
    /// End of a mark-sweep-compact garbage collection pass.
    fn gc_epilogue(&self, flags: GcFlags);

    /// The heap is about to hit its limit. Returns the new limit; returning
    /// a larger value grants temporary headroom instead of crashing.
    fn near_heap_limit(&self, current_limit: usize) -> usize;

    /// A promise was rejected with no handler attached.
    fn promise_rejected(&self, message: String);

    /// The allocator cannot satisfy a request at all. Unrecoverable.
    fn oom(&self, location: &str, stats: &HeapStatistics) -> !;
}

// ── Construction ─────────────────────────────────────────────────────────

/// Engine-specific heap-size hints computed from an environment's memory
/// limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConstraints {
    pub max_semi_space_size_kb: usize,
    pub max_old_space_size_mb: usize,
}

impl ResourceConstraints {
    /// Derive constraints from a memory limit in megabytes. The semi-space
    /// grows exponentially with the limit (2^(mb/128 + 10) KB) while old
    /// space tracks the limit directly.
    pub fn from_memory_limit_mb(memory_limit_mb: usize) -> Self {
        let semi_space = 2f64.powf(memory_limit_mb as f64 / 128.0 + 10.0);
        ResourceConstraints {
            max_semi_space_size_kb: semi_space as usize,
            max_old_space_size_mb: memory_limit_mb,
        }
    }
}

/// Builds sandboxed engine instances. The factory installs the supplied
/// hooks and a limit-tracking allocator, and must discard any thread-local
/// engine state so the instance is safe to first use from any worker thread.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        constraints: &ResourceConstraints,
        snapshot: Option<&[u8]>,
        hooks: Arc<dyn EngineHooks>,
    ) -> Result<Box<dyn ScriptEngine>>;
}

// ── Diagnostics ──────────────────────────────────────────────────────────

/// Dump heap statistics for an unrecoverable allocator-level OOM. The
/// process is expected to abort immediately afterwards; continuing risks
/// process-wide corruption.
pub fn dump_heap_statistics(location: &str, stats: &HeapStatistics) {
    let heap = serde_json::to_string_pretty(stats)
        .unwrap_or_else(|_| format!("{stats:?}"));
    tracing::error!(location, heap = %heap, "engine out of memory");
}
