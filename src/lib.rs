//! Multiplexes many independently resource-bounded, sandboxed
//! script-execution environments onto a small, shared pool of worker
//! threads, while giving each environment the illusion of owning its own
//! single-threaded execution engine.
//!
//! # Features
//!
//! - Per-environment mutual exclusion: exactly one thread touches an
//!   environment's engine at a time ([`ExecutorLock`]).
//! - A run/wait state machine that wakes an idle environment exactly once
//!   and dispatches it to the default execution context or a pool worker
//!   ([`Scheduler`]).
//! - CPU- and wall-time accounting that survives pauses, re-entrancy, and
//!   nested timers.
//! - Proactive memory-limit enforcement that terminates an environment
//!   before the allocator can abort the process ([`HeapCheck`]).
//! - Safe teardown of environments with in-flight cross-thread work.
//!
//! The script engine itself is consumed as an opaque capability behind
//! [`ScriptEngine`]; embedders supply an [`EngineFactory`] for sandboxed
//! instances.
//!
//! # Example
//!
//! ```rust,ignore
//! use isolate_pool::{Environment, EnvironmentOptions, Platform, PlatformConfig};
//!
//! // On the default thread, once at process start:
//! let platform = Platform::new(PlatformConfig::default());
//! let root = Environment::root(&platform, host_engine);
//!
//! // Sandboxed environments get their own engine and memory limit:
//! let options = EnvironmentOptions { memory_limit_mb: 64, snapshot: None };
//! let holder = Environment::new(&platform, options, &factory)?;
//!
//! let env = holder.environment()?;
//! let mut scheduler = env.scheduler().lock();
//! scheduler.push_task(Box::new(|env: &std::sync::Arc<Environment>| {
//!     // runs on a pool worker, under the executor lock
//! }));
//! scheduler.wake_isolate(&env);
//! ```

pub mod engine;
pub mod environment;
pub mod error;
pub mod executor;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

pub use engine::{
    dump_heap_statistics, EngineFactory, EngineHooks, EngineId, GcFlags, HeapStatistics,
    InterruptCallback, MemoryPressureLevel, ResourceConstraints, ScriptEngine,
};
pub use environment::{
    DebugAgent, Environment, EnvironmentHandle, EnvironmentOptions, HeapCheck, WeakHandle,
    DEFAULT_MEMORY_LIMIT_MB,
};
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorLock, ExecutorUnlock};
pub use platform::{default_pool_size, Platform, PlatformConfig};
pub use pool::ThreadPool;
pub use registry::Registry;
pub use scheduler::{AsyncWait, Runnable, Scheduler, SchedulerLock, Status, WaitState};
