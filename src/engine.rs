//! Embedding hooks for the script execution engine.
//!
//! The engine is an external collaborator: the scheduler never sees script
//! semantics, only opaque contexts and compiled units. Contexts are created
//! once per pool thread, held in the context registry, and only ever used
//! from their owning thread.

use std::any::Any;
use std::sync::Arc;

use crate::error::SchedulerError;
use crate::interrupt::InterruptPoint;
use crate::worker::Worker;

/// Why a script execution stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionAbort {
    /// The engine honored an `Abort` disposition from the interrupt point.
    /// Not a script fault.
    Interrupted,
    /// The script itself failed (uncaught exception or engine fault).
    Fault(String),
}

/// An engine-compiled script, opaque to the scheduler.
pub trait CompiledScript: Send {
    fn as_any(&self) -> &dyn Any;
}

/// One script execution environment, owned by a single pool thread.
///
/// Implementations must call [`InterruptPoint::check`] at their own safe
/// points during `execute` and unwind with `ExecutionAbort::Interrupted`
/// when it returns `Abort`. How the engine chooses those points is up to
/// the engine; the scheduler only defines what the check may decide.
pub trait RuntimeContext: Send + Sync {
    /// Associate a worker's global environment with this context for the
    /// duration of a queue drain. A failure here (for example a parse
    /// error in the worker's bootstrap) ends the drain.
    fn attach_global(&self, worker: &Arc<Worker>) -> Result<(), String>;

    /// Drop the association so the global environment can be collected.
    fn detach_global(&self);

    /// Compile source text into an executable unit. The error string is
    /// the engine's diagnostic.
    fn compile(&self, source: &str, name: &str) -> Result<Box<dyn CompiledScript>, String>;

    /// Execute a previously compiled unit against the attached global.
    fn execute(
        &self,
        script: &dyn CompiledScript,
        interrupt: &InterruptPoint,
    ) -> Result<(), ExecutionAbort>;
}

/// Factory for per-thread runtime contexts.
pub trait ScriptEngine: Send + Sync {
    fn create_context(&self) -> Result<Arc<dyn RuntimeContext>, SchedulerError>;
}

/// Arc wrapper for ScriptEngine trait objects.
pub type EngineHandle = Arc<dyn ScriptEngine>;

/// Arc wrapper for RuntimeContext trait objects.
pub type ContextHandle = Arc<dyn RuntimeContext>;
