//! Worker execution scheduling over a bounded thread pool
//!
//! This crate multiplexes logical script workers onto a small pool of OS
//! threads: each worker gets a FIFO task queue drained by at most one
//! pool thread at a time, long-running scripts yield and observe
//! suspension or cancellation at cooperative interrupt points, and a
//! blocked worker lends its thread slot back to the pool so the rest of
//! the system keeps moving. A script load pipeline fetches, compiles and
//! runs worker scripts in URL order against pluggable engine and fetcher
//! backends.

mod dispatch;
mod engine;
mod error;
mod interrupt;
mod limits;
mod loader;
mod pool;
mod registry;
mod task;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatch::WorkerService;
pub use engine::{
    CompiledScript, ContextHandle, EngineHandle, ExecutionAbort, RuntimeContext, ScriptEngine,
};
pub use error::SchedulerError;
pub use interrupt::{EventProbe, InterruptDisposition, InterruptPoint};
pub use limits::{PoolConfig, SchedulingMode};
pub use loader::{
    AllowAllPolicy, FetchCallback, FetchHandle, FetchOutcome, FetcherHandle, LoadPolicy,
    PolicyHandle, ScriptFetcher,
};
pub use pool::{CapacityToken, ListenerHandle, PoolListener, ThreadPool, WorkItem};
pub use registry::ContextRegistry;
pub use task::{Task, TaskContext, TaskFn, TaskResult};
pub use worker::{Worker, WorkerId};
