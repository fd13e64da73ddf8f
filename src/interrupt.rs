//! Cooperative interrupt points.
//!
//! Long-running script execution is periodically interrupted by the engine
//! calling [`InterruptPoint::check`] at its safe points. The check decides
//! whether execution continues, waits out a suspension, yields the thread,
//! or aborts. Cancellation is never preemptive; it is observed here.

use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::debug;

use crate::limits::PoolConfig;
use crate::pool::{CapacityToken, ThreadPool};
use crate::worker::Worker;

/// What the engine should do after an interrupt check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDisposition {
    Continue,
    /// Unwind execution immediately. Raised for cancellation, a pending
    /// external event, or an expired execution deadline.
    Abort,
}

/// Probe for pending external events. Sampled at a configurable rate; a
/// `true` result surrenders execution without cancelling the worker.
pub type EventProbe = Box<dyn Fn() -> bool + Send>;

/// Per-execution interrupt state. Create one at the start of each script
/// execution; the yield counter on the worker is reset at construction.
pub struct InterruptPoint {
    worker: Arc<Worker>,
    pool: ThreadPool,
    yield_threshold: u32,
    probe: Option<EventProbe>,
    probe_interval: u32,
    probe_count: Cell<u32>,
    deadline: Option<Instant>,
}

impl InterruptPoint {
    pub fn new(worker: Arc<Worker>, pool: ThreadPool, config: &PoolConfig) -> Self {
        worker.reset_callback_count();
        InterruptPoint {
            worker,
            pool,
            yield_threshold: config.yield_threshold(),
            probe: None,
            probe_interval: config.event_probe_interval,
            probe_count: Cell::new(0),
            deadline: config.execution_deadline.map(|budget| Instant::now() + budget),
        }
    }

    /// Install an external-event probe.
    pub fn with_event_probe(mut self, probe: EventProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// The worker this interrupt point observes.
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// The periodic check. The engine must call this every N execution
    /// steps; it never triggers on elapsed time alone.
    pub fn check(&self) -> InterruptDisposition {
        // Suspension wait loop. Capacity is borrowed once on first entry
        // and returned on every exit path, resumed or cancelled.
        let mut was_suspended = false;
        let mut borrow: Option<CapacityToken> = None;
        loop {
            if self.worker.is_cancelled() {
                debug!("aborting execution for cancelled {}", self.worker.id());
                drop(borrow);
                return InterruptDisposition::Abort;
            }
            if !self.worker.is_suspended() {
                drop(borrow);
                break;
            }
            if !was_suspended {
                // This thread is about to block, so open another slot in
                // the pool for other workers. A failed borrow (cap
                // reached) means blocking without extra capacity.
                borrow = self.pool.borrow_thread();
                was_suspended = true;
            }
            self.worker.wait_while_suspended_once();
        }

        if self.worker.bump_callback_count() >= self.yield_threshold {
            thread::yield_now();
            self.worker.reset_callback_count();
        }

        if let Some(probe) = &self.probe {
            let samples = self.probe_count.get() + 1;
            if samples >= self.probe_interval {
                self.probe_count.set(0);
                if probe() {
                    debug!(
                        "surrendering execution of {} to a pending external event",
                        self.worker.id()
                    );
                    return InterruptDisposition::Abort;
                }
            } else {
                self.probe_count.set(samples);
            }
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!("execution deadline expired for {}", self.worker.id());
                return InterruptDisposition::Abort;
            }
        }

        InterruptDisposition::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::PoolListener;
    use crate::testing::wait_until;
    use url::Url;

    struct NoopListener;
    impl PoolListener for NoopListener {}

    fn fixture() -> (Arc<Worker>, ThreadPool, PoolConfig) {
        let config = PoolConfig::default();
        let pool = ThreadPool::new(&config, Arc::new(NoopListener));
        let worker = Arc::new(Worker::new(Url::parse("http://example.com/").unwrap()));
        (worker, pool, config)
    }

    #[test]
    fn idle_worker_continues() {
        let (worker, pool, config) = fixture();
        let point = InterruptPoint::new(worker, pool.clone(), &config);
        assert_eq!(point.check(), InterruptDisposition::Continue);
        pool.shutdown();
    }

    #[test]
    fn cancelled_worker_aborts() {
        let (worker, pool, config) = fixture();
        worker.cancel();
        let point = InterruptPoint::new(worker, pool.clone(), &config);
        assert_eq!(point.check(), InterruptDisposition::Abort);
        pool.shutdown();
    }

    #[test]
    fn yield_threshold_resets_counter() {
        let (worker, pool, config) = fixture();
        let point = InterruptPoint::new(worker.clone(), pool.clone(), &config);
        for _ in 0..config.yield_threshold() {
            assert_eq!(point.check(), InterruptDisposition::Continue);
        }
        assert_eq!(worker.callback_count(), 0);
        pool.shutdown();
    }

    #[test]
    fn suspension_borrows_capacity_and_returns_it_on_resume() {
        let (worker, pool, config) = fixture();
        let baseline = pool.baseline();
        worker.suspend();

        let w = worker.clone();
        let p = pool.clone();
        let handle = thread::spawn(move || InterruptPoint::new(w, p, &config).check());

        assert!(wait_until(Duration::from_secs(5), || {
            pool.thread_limit() == baseline + 1
        }));

        thread::sleep(Duration::from_millis(50));
        worker.resume();

        assert_eq!(handle.join().unwrap(), InterruptDisposition::Continue);
        assert_eq!(pool.thread_limit(), baseline);
        pool.shutdown();
    }

    #[test]
    fn cancel_while_suspended_returns_borrowed_capacity() {
        let (worker, pool, config) = fixture();
        let baseline = pool.baseline();
        worker.suspend();

        let w = worker.clone();
        let p = pool.clone();
        let handle = thread::spawn(move || InterruptPoint::new(w, p, &config).check());

        assert!(wait_until(Duration::from_secs(5), || {
            pool.thread_limit() == baseline + 1
        }));

        worker.cancel();

        assert_eq!(handle.join().unwrap(), InterruptDisposition::Abort);
        assert_eq!(pool.thread_limit(), baseline);
        pool.shutdown();
    }

    #[test]
    fn pending_external_event_aborts_without_cancelling() {
        let (worker, pool, mut config) = fixture();
        config.event_probe_interval = 1;
        let point = InterruptPoint::new(worker.clone(), pool.clone(), &config)
            .with_event_probe(Box::new(|| true));
        assert_eq!(point.check(), InterruptDisposition::Abort);
        assert!(!worker.is_cancelled());
        pool.shutdown();
    }

    #[test]
    fn expired_deadline_aborts() {
        let (worker, pool, mut config) = fixture();
        config.execution_deadline = Some(Duration::from_millis(0));
        let point = InterruptPoint::new(worker, pool.clone(), &config);
        assert_eq!(point.check(), InterruptDisposition::Abort);
        pool.shutdown();
    }
}
