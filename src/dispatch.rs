//! Worker dispatch service.
//!
//! Multiplexes logical workers onto the bounded thread pool. Every worker
//! with pending tasks owns exactly one entry in the in-progress table;
//! the pool-side drain loop pops that worker's tasks one at a time until
//! the queue runs dry, so tasks for one worker run FIFO and never
//! concurrently while workers as a group fill the pool.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, warn};

use crate::engine::EngineHandle;
use crate::error::SchedulerError;
use crate::interrupt::InterruptPoint;
use crate::limits::PoolConfig;
use crate::loader::{AllowAllPolicy, FetcherHandle, PolicyHandle, ScriptLoader};
use crate::pool::ThreadPool;
use crate::registry::{ContextListener, ContextRegistry};
use crate::task::{Task, TaskContext};
use crate::worker::{Worker, WorkerId};

/// Pending work for one worker. The generation disambiguates an entry
/// that was removed and re-inserted while a failed submission was still
/// unwinding.
struct QueueEntry {
    tasks: VecDeque<Task>,
    generation: u64,
}

struct ServiceShared {
    /// Workers with queued or running tasks. Presence in this table is
    /// what `wait_for_worker_drain` and `cancel_worker` block on.
    table: Mutex<HashMap<WorkerId, QueueEntry>>,
    cvar: Condvar,
    pool: ThreadPool,
    registry: Arc<ContextRegistry>,
    fetcher: FetcherHandle,
    policy: PolicyHandle,
    config: PoolConfig,
    next_generation: AtomicU64,
}

/// The scheduler's front door. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct WorkerService {
    shared: Arc<ServiceShared>,
}

impl WorkerService {
    pub fn new(engine: EngineHandle, fetcher: FetcherHandle, config: PoolConfig) -> Self {
        Self::with_policy(engine, fetcher, Arc::new(AllowAllPolicy), config)
    }

    pub fn with_policy(
        engine: EngineHandle,
        fetcher: FetcherHandle,
        policy: PolicyHandle,
        config: PoolConfig,
    ) -> Self {
        config.validate();
        let registry = Arc::new(ContextRegistry::new());
        let listener = Arc::new(ContextListener::new(engine, registry.clone()));
        let pool = ThreadPool::new(&config, listener);
        WorkerService {
            shared: Arc::new(ServiceShared {
                table: Mutex::new(HashMap::new()),
                cvar: Condvar::new(),
                pool,
                registry,
                fetcher,
                policy,
                config,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Queue a task for a worker. If the worker already has an entry in
    /// the table its drain loop is still running and will pick the task
    /// up; otherwise a new drain is submitted to the pool.
    pub fn dispatch(&self, worker: &Arc<Worker>, task: Task) -> Result<(), SchedulerError> {
        if worker.is_cancelled() {
            return Err(SchedulerError::Unavailable);
        }

        let id = worker.id();
        let needs_drain = {
            let mut table = self.shared.table.lock().unwrap();
            match table.entry(id) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().tasks.push_back(task);
                    None
                }
                Entry::Vacant(entry) => {
                    let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
                    let mut tasks = VecDeque::new();
                    tasks.push_back(task);
                    entry.insert(QueueEntry { tasks, generation });
                    Some(generation)
                }
            }
        };

        let Some(generation) = needs_drain else {
            return Ok(());
        };

        debug!("starting drain for {id}");
        let service = self.clone();
        let worker = worker.clone();
        let submitted = self
            .shared
            .pool
            .submit(Box::new(move || service.drain_worker(&worker)));

        if let Err(err) = submitted {
            // Unwind the entry we created, unless a racing dispatch
            // already replaced it.
            let mut table = self.shared.table.lock().unwrap();
            if table.get(&id).is_some_and(|e| e.generation == generation) {
                table.remove(&id);
                self.shared.cvar.notify_all();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Pool-side entry point: run one worker's queue to exhaustion.
    fn drain_worker(&self, worker: &Arc<Worker>) {
        let id = worker.id();
        let Some(context) = self.shared.registry.current() else {
            // This pool thread came up without an execution context; the
            // worker's tasks cannot run anywhere else.
            warn!("no execution context on this thread, dropping tasks for {id}");
            self.complete_worker(id);
            return;
        };

        if let Err(message) = context.attach_global(worker) {
            warn!("failed to attach global for {id}: {message}");
            self.complete_worker(id);
            return;
        }

        self.run_queue(worker, &context);
        context.detach_global();
    }

    fn run_queue(&self, worker: &Arc<Worker>, context: &crate::engine::ContextHandle) {
        let id = worker.id();
        loop {
            let task = {
                let mut table = self.shared.table.lock().unwrap();
                let Some(entry) = table.get_mut(&id) else {
                    debug_assert!(false, "draining a queue not present in the table");
                    return;
                };
                if worker.is_cancelled() {
                    // Pending tasks die with the worker.
                    debug!("{id} cancelled, dropping {} pending tasks", entry.tasks.len());
                    table.remove(&id);
                    self.shared.cvar.notify_all();
                    return;
                }
                match entry.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        table.remove(&id);
                        self.shared.cvar.notify_all();
                        return;
                    }
                }
            };

            let label = task.label().to_string();
            let cx = TaskContext::new(worker, context, self);
            let result = task.run(&cx);
            if !result.success {
                // One failed task does not stop the queue.
                warn!(
                    "task {label:?} for {id} failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    /// Drop the worker's table entry and wake anyone waiting on it.
    fn complete_worker(&self, id: WorkerId) {
        let mut table = self.shared.table.lock().unwrap();
        table.remove(&id);
        self.shared.cvar.notify_all();
    }

    /// Cancel the worker and block until its drain loop has retired.
    /// Pending tasks are dropped; an in-flight task or script load sees
    /// the cancellation at its next interrupt point.
    pub fn cancel_worker(&self, worker: &Arc<Worker>) {
        worker.cancel();
        self.wait_for_worker_drain(worker.id());
    }

    /// Block until the worker has no entry in the in-progress table.
    pub fn wait_for_worker_drain(&self, id: WorkerId) {
        let mut table = self.shared.table.lock().unwrap();
        while table.contains_key(&id) {
            table = self.shared.cvar.wait(table).unwrap();
        }
    }

    /// Pause the worker. A running task blocks at its next interrupt
    /// point; queued tasks behind it wait in FIFO order.
    pub fn suspend_worker(&self, worker: &Arc<Worker>) {
        worker.suspend();
    }

    pub fn resume_worker(&self, worker: &Arc<Worker>) {
        worker.resume();
    }

    /// Stop the pool, then drop whatever the table still holds. Tasks
    /// already running finish; queued work is discarded.
    pub fn shutdown(&self) {
        self.shared.pool.shutdown();
        let mut table = self.shared.table.lock().unwrap();
        table.clear();
        self.shared.cvar.notify_all();
    }

    pub(crate) fn interrupt_point(&self, worker: &Arc<Worker>) -> InterruptPoint {
        InterruptPoint::new(worker.clone(), self.shared.pool.clone(), &self.shared.config)
    }

    pub(crate) fn script_loader(&self, worker: &Arc<Worker>) -> ScriptLoader {
        ScriptLoader::new(
            worker.clone(),
            self.shared.pool.clone(),
            self.shared.fetcher.clone(),
            self.shared.policy.clone(),
            self.shared.config.clone(),
        )
    }

    pub fn thread_limit(&self) -> usize {
        self.shared.pool.thread_limit()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.pool.thread_count()
    }
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService")
            .field("thread_limit", &self.thread_limit())
            .field("thread_count", &self.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::task::TaskResult;
    use crate::testing::{MockEngine, MockFetcher, wait_until};

    fn service() -> WorkerService {
        service_with_config(PoolConfig::default())
    }

    fn service_with_config(config: PoolConfig) -> WorkerService {
        let _ = env_logger::builder().is_test(true).try_init();
        let engine = MockEngine::new();
        let fetcher = Arc::new(MockFetcher::new());
        WorkerService::new(Arc::new(engine), fetcher, config)
    }

    fn worker() -> Arc<Worker> {
        Arc::new(Worker::new(Url::parse("http://example.com/").unwrap()))
    }

    #[test]
    fn tasks_for_one_worker_run_in_dispatch_order() {
        let service = service();
        let w = worker();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = order.clone();
            service
                .dispatch(
                    &w,
                    Task::new(move |_cx| {
                        order.lock().unwrap().push(i);
                        TaskResult::success()
                    }),
                )
                .unwrap();
        }
        service.wait_for_worker_drain(w.id());

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        service.shutdown();
    }

    #[test]
    fn workers_run_concurrently_but_each_on_one_thread_at_a_time() {
        let service = service();
        let active = Arc::new(Mutex::new(HashMap::<WorkerId, usize>::new()));
        let overlap = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4).map(|_| worker()).collect();
        for w in &workers {
            for _ in 0..25 {
                let active = active.clone();
                let overlap = overlap.clone();
                service
                    .dispatch(
                        w,
                        Task::new(move |cx| {
                            let id = cx.worker().id();
                            {
                                let mut map = active.lock().unwrap();
                                let count = map.entry(id).or_insert(0);
                                *count += 1;
                                if *count > 1 {
                                    overlap.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            std::thread::sleep(Duration::from_micros(200));
                            *active.lock().unwrap().get_mut(&id).unwrap() -= 1;
                            TaskResult::success()
                        }),
                    )
                    .unwrap();
            }
        }
        for w in &workers {
            service.wait_for_worker_drain(w.id());
        }

        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        service.shutdown();
    }

    #[test]
    fn dispatch_to_cancelled_worker_is_rejected() {
        let service = service();
        let w = worker();
        w.cancel();
        let err = service
            .dispatch(&w, Task::new(|_cx| TaskResult::success()))
            .unwrap_err();
        assert_eq!(err, SchedulerError::Unavailable);
        service.shutdown();
    }

    #[test]
    fn dispatch_after_shutdown_fails() {
        let service = service();
        service.shutdown();
        let err = service
            .dispatch(&worker(), Task::new(|_cx| TaskResult::success()))
            .unwrap_err();
        assert_eq!(err, SchedulerError::DispatchFailed);
    }

    #[test]
    fn cancel_drops_pending_tasks() {
        let service = service();
        let w = worker();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // First task parks until released so the rest stay queued.
        {
            let gate = gate.clone();
            service
                .dispatch(
                    &w,
                    Task::new(move |_cx| {
                        let (lock, cvar) = &*gate;
                        let mut released = lock.lock().unwrap();
                        while !*released {
                            released = cvar.wait(released).unwrap();
                        }
                        TaskResult::success()
                    }),
                )
                .unwrap();
        }

        let (task, rx) = Task::with_result(|_cx| TaskResult::success());
        service.dispatch(&w, task).unwrap();

        w.cancel();
        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        service.wait_for_worker_drain(w.id());

        // The queued task was dropped without running, so its result
        // channel closed empty.
        assert!(rx.blocking_recv().is_err());
        service.shutdown();
    }

    #[test]
    fn suspended_worker_borrows_capacity_until_resumed() {
        let service = service();
        let w = worker();
        let baseline = service.thread_limit();
        let ran = Arc::new(AtomicUsize::new(0));

        w.suspend();
        {
            let ran = ran.clone();
            service
                .dispatch(
                    &w,
                    Task::new(move |cx| {
                        let interrupt = cx.interrupt_point();
                        // Parks here while suspended.
                        interrupt.check();
                        ran.fetch_add(1, Ordering::SeqCst);
                        TaskResult::success()
                    }),
                )
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || {
            service.thread_limit() == baseline + 1
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        service.resume_worker(&w);
        service.wait_for_worker_drain(w.id());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(service.thread_limit(), baseline);
        service.shutdown();
    }

    #[test]
    fn capacity_borrowing_stops_at_the_hard_cap() {
        let service = service();
        let baseline = service.thread_limit();
        let cap = PoolConfig::default().thread_cap;
        let workers: Vec<_> = (0..25).map(|_| worker()).collect();

        for w in &workers {
            w.suspend();
            service
                .dispatch(
                    w,
                    Task::new(move |cx| {
                        cx.interrupt_point().check();
                        TaskResult::success()
                    }),
                )
                .unwrap();
        }

        // Limit climbs as suspended tasks borrow, but never past the cap.
        assert!(wait_until(Duration::from_secs(10), || {
            service.thread_limit() >= cap
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(service.thread_limit(), cap);

        for w in &workers {
            service.resume_worker(w);
        }
        for w in &workers {
            service.wait_for_worker_drain(w.id());
        }
        assert_eq!(service.thread_limit(), baseline);
        service.shutdown();
    }

    #[test]
    fn many_workers_all_complete_within_the_baseline() {
        let service = service();
        let done = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..25).map(|_| worker()).collect();

        for w in &workers {
            let done = done.clone();
            service
                .dispatch(
                    w,
                    Task::new(move |_cx| {
                        done.fetch_add(1, Ordering::SeqCst);
                        TaskResult::success()
                    }),
                )
                .unwrap();
        }
        for w in &workers {
            service.wait_for_worker_drain(w.id());
        }

        assert_eq!(done.load(Ordering::SeqCst), 25);
        assert_eq!(service.thread_limit(), PoolConfig::default().thread_limit);
        service.shutdown();
    }

    #[test]
    fn failed_task_does_not_stop_the_queue() {
        let service = service();
        let w = worker();

        service
            .dispatch(&w, Task::new(|_cx| TaskResult::err("this one breaks")))
            .unwrap();
        let (task, rx) = Task::with_result(|_cx| TaskResult::success());
        service.dispatch(&w, task).unwrap();

        let result = rx.blocking_recv().unwrap();
        assert!(result.success);
        service.shutdown();
    }

    #[test]
    fn attach_failure_retires_the_worker() {
        let engine = MockEngine::new();
        engine.fail_attach();
        let service = WorkerService::new(
            Arc::new(engine),
            Arc::new(MockFetcher::new()),
            PoolConfig::default(),
        );
        let w = worker();

        let (task, rx) = Task::with_result(|_cx| TaskResult::success());
        service.dispatch(&w, task).unwrap();

        // The drain aborts before running anything, and the worker's
        // entry is released rather than leaking.
        assert!(rx.blocking_recv().is_err());
        service.wait_for_worker_drain(w.id());
        service.shutdown();
    }

    #[test]
    fn tasks_can_load_scripts_through_their_context() {
        let engine = MockEngine::new();
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.script(
            "http://example.com/lib.js",
            Duration::from_millis(5),
            crate::loader::FetchOutcome::ok("lib"),
        );
        let service = WorkerService::new(
            Arc::new(engine.clone()),
            fetcher,
            PoolConfig::default(),
        );
        let w = worker();

        let (task, rx) = Task::with_result(|cx| cx.load_and_run_one("lib.js").into());
        service.dispatch(&w, task).unwrap();

        let result = rx.blocking_recv().unwrap();
        assert!(result.success, "load failed: {:?}", result.error);
        assert_eq!(
            engine.events_with_prefix("execute:"),
            ["execute:http://example.com/lib.js"]
        );
        service.shutdown();
    }
}
