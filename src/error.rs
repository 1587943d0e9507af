//! Error taxonomy for environment execution.
//!
//! Resource and runtime failures propagate as [`Error`] values to the caller
//! of the task that was executing. Programmer errors (duplicate weak-callback
//! registration, `done_running` outside a pass, terminating the root
//! environment) are invariant violations and panic instead; they must never
//! be caught and retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The environment exceeded its memory limit even after a forced
    /// collection and was terminated. Fatal to the operation; not retried.
    #[error("isolate was disposed during execution due to memory limit")]
    MemoryLimit,

    /// The environment was terminated while the operation was in flight.
    #[error("isolate was terminated during execution")]
    Terminated,

    /// The owning handle has already released the environment. All
    /// operations against a disposed environment fail fast rather than hang.
    #[error("isolate is already disposed")]
    Disposed,

    /// An unhandled rejected promise surfaced at the task epilogue.
    #[error("unhandled promise rejection: {0}")]
    Runtime(String),

    /// A snapshot blob failed envelope validation before reaching the engine.
    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    /// The engine factory could not build a sandboxed engine instance.
    #[error("failed to create engine instance: {0}")]
    EngineCreation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
