use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::dispatch::WorkerService;
use crate::engine::ContextHandle;
use crate::error::SchedulerError;
use crate::interrupt::InterruptPoint;
use crate::worker::Worker;
use std::sync::Arc;

// ============================================================================
// Task result
// ============================================================================

/// Result of a task execution, reported to the submitter over the task's
/// completion channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Success or failure
    pub success: bool,
    /// JSON data returned (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    /// Error message if failed (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// Create a successful result with optional data
    pub fn ok(data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
        }
    }

    /// Create a failed result with an error message
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }

    /// Create a successful result with no data
    pub fn success() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }
}

impl Default for TaskResult {
    fn default() -> Self {
        Self::success()
    }
}

impl From<Result<(), SchedulerError>> for TaskResult {
    fn from(result: Result<(), SchedulerError>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(err) => Self::err(err.to_string()),
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// Closure type executed on a pool thread while the task's worker is
/// associated with that thread's runtime context.
pub type TaskFn = Box<dyn FnOnce(&TaskContext<'_>) -> TaskResult + Send + 'static>;

/// One unit of work tied to exactly one worker.
///
/// Ownership moves into the worker's queue on submission. A task dropped
/// without running (worker cancelled, dispatch failure, shutdown) drops
/// its completion sender, so the submitter's receiver resolves with a
/// closed-channel error instead of hanging.
pub struct Task {
    label: String,
    run: TaskFn,
    res_tx: Option<oneshot::Sender<TaskResult>>,
}

impl Task {
    /// Create a fire-and-forget task.
    pub fn new(run: impl FnOnce(&TaskContext<'_>) -> TaskResult + Send + 'static) -> Self {
        Self::labeled("task", run)
    }

    /// Create a fire-and-forget task with a label used in diagnostics.
    pub fn labeled(
        label: impl Into<String>,
        run: impl FnOnce(&TaskContext<'_>) -> TaskResult + Send + 'static,
    ) -> Self {
        Task {
            label: label.into(),
            run: Box::new(run),
            res_tx: None,
        }
    }

    /// Create a task plus a receiver for its result.
    pub fn with_result(
        run: impl FnOnce(&TaskContext<'_>) -> TaskResult + Send + 'static,
    ) -> (Self, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        let mut task = Self::new(run);
        task.res_tx = Some(tx);
        (task, rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the task and deliver its result. Called from the drain loop.
    pub(crate) fn run(self, cx: &TaskContext<'_>) -> TaskResult {
        let result = (self.run)(cx);
        if let Some(tx) = self.res_tx {
            // The submitter may have dropped the receiver; that's fine.
            let _ = tx.send(result.clone());
        }
        result
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("label", &self.label).finish()
    }
}

// ============================================================================
// Task context
// ============================================================================

/// Everything a running task may touch: its worker, the runtime context of
/// the current pool thread, and the service (for script loads and
/// interrupt points).
pub struct TaskContext<'a> {
    worker: &'a Arc<Worker>,
    context: &'a ContextHandle,
    service: &'a WorkerService,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        worker: &'a Arc<Worker>,
        context: &'a ContextHandle,
        service: &'a WorkerService,
    ) -> Self {
        TaskContext {
            worker,
            context,
            service,
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        self.worker
    }

    pub fn context(&self) -> &ContextHandle {
        self.context
    }

    pub fn service(&self) -> &WorkerService {
        self.service
    }

    /// Interrupt point for a script execution this task is about to start.
    pub fn interrupt_point(&self) -> InterruptPoint {
        self.service.interrupt_point(self.worker)
    }

    /// Fetch, compile and execute a batch of scripts on this thread. See
    /// the loader module for ordering and cancellation semantics.
    pub fn load_and_run(&self, urls: &[&str]) -> Result<(), SchedulerError> {
        self.service
            .script_loader(self.worker)
            .load_and_run(self.context, urls)
    }

    /// Single-script convenience wrapper around [`Self::load_and_run`].
    pub fn load_and_run_one(&self, url: &str) -> Result<(), SchedulerError> {
        self.load_and_run(&[url])
    }
}
