use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, Weak};

use log::debug;
use url::Url;

/// Unique identity for one logical worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation hook for an in-flight script load, registered on the
/// load's worker so cancelling the worker reaches loads that are blocking
/// a pool thread.
pub(crate) trait CancellableLoad: Send + Sync {
    fn cancel_load(&self);
}

/// One logical background execution unit.
///
/// Workers are not threads; they are multiplexed onto pool threads by the
/// dispatcher, at most one pool thread per worker at a time. The
/// cancellation flag is monotonic (set once, never cleared); the
/// suspension flag toggles. Both are observed cooperatively at interrupt
/// points and queue-drain boundaries rather than preempting anything.
pub struct Worker {
    id: WorkerId,
    base_url: Url,
    cancelled: AtomicBool,
    suspended: AtomicBool,
    // Suspension monitor: cancel() and resume() notify it so a thread
    // blocked at an interrupt point re-checks the flags.
    monitor: Mutex<()>,
    condvar: Condvar,
    // Interrupt checks since the last cooperative yield. Only the single
    // thread draining this worker touches it, so Relaxed is enough.
    callback_count: AtomicU32,
    loads: Mutex<Vec<Weak<dyn CancellableLoad>>>,
}

impl Worker {
    pub fn new(base_url: Url) -> Self {
        Worker {
            id: WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)),
            base_url,
            cancelled: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            monitor: Mutex::new(()),
            condvar: Condvar::new(),
            callback_count: AtomicU32::new(0),
            loads: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Mark the worker cancelled, abort its in-flight script loads, and
    /// wake any thread blocked on the suspension monitor. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("cancelling {}", self.id);

        let loads: Vec<_> = {
            let mut loads = self.loads.lock().unwrap();
            loads.drain(..).collect()
        };
        for load in loads {
            if let Some(load) = load.upgrade() {
                load.cancel_load();
            }
        }

        let _guard = self.monitor.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Suspend the worker. Observed at the next interrupt check.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// Resume a suspended worker and wake any thread waiting on it.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        let _guard = self.monitor.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Block until the suspension monitor is notified, unless the worker
    /// is no longer suspended (or has been cancelled) by the time the
    /// monitor is held. Callers loop and re-check both flags per wake.
    pub(crate) fn wait_while_suspended_once(&self) {
        let guard = self.monitor.lock().unwrap();
        if self.is_suspended() && !self.is_cancelled() {
            drop(self.condvar.wait(guard).unwrap());
        }
    }

    pub(crate) fn bump_callback_count(&self) -> u32 {
        self.callback_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_callback_count(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self) -> u32 {
        self.callback_count.load(Ordering::Relaxed)
    }

    pub(crate) fn register_load(&self, load: Weak<dyn CancellableLoad>) {
        self.loads.lock().unwrap().push(load);
    }

    pub(crate) fn deregister_load(&self, load: &Weak<dyn CancellableLoad>) {
        let mut loads = self.loads.lock().unwrap();
        loads.retain(|entry| !entry.ptr_eq(load));
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker() -> Worker {
        Worker::new(Url::parse("http://example.com/").unwrap())
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(test_worker().id(), test_worker().id());
    }

    #[test]
    fn cancel_is_monotonic() {
        let worker = test_worker();
        assert!(!worker.is_cancelled());
        worker.cancel();
        worker.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn suspension_toggles() {
        let worker = test_worker();
        worker.suspend();
        assert!(worker.is_suspended());
        worker.resume();
        assert!(!worker.is_suspended());
    }
}
