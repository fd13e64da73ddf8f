//! Bounded thread pool with a dynamically adjustable thread limit.
//!
//! The pool never runs more threads than its current limit. Callers that
//! are about to block a pool thread outside the pool's own scheduling can
//! borrow one slot of extra capacity with [`ThreadPool::borrow_thread`] so
//! the remaining workers keep getting serviced.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::error::SchedulerError;
use crate::limits::PoolConfig;

/// One unit of pool work.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle hooks invoked from inside each pool thread.
///
/// `on_thread_created` runs before the thread services its first work item
/// and `on_thread_shutting_down` runs right before the thread exits. The
/// context registry uses these to attach and detach per-thread runtime
/// contexts.
pub trait PoolListener: Send + Sync {
    fn on_thread_created(&self) {}
    fn on_thread_shutting_down(&self) {}
}

/// Arc wrapper for PoolListener trait objects.
pub type ListenerHandle = Arc<dyn PoolListener>;

struct PoolState {
    queue: VecDeque<WorkItem>,
    thread_limit: usize,
    threads: usize,
    idle: usize,
    shutting_down: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cvar: Condvar,
    listener: ListenerHandle,
    baseline: usize,
    idle_limit: usize,
    cap: usize,
    name: String,
    next_thread_index: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded OS thread pool. Work items are serviced in submission order by
/// whichever thread becomes available first.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub fn new(config: &PoolConfig, listener: ListenerHandle) -> Self {
        config.validate();
        debug!(
            "creating thread pool '{}' (limit {}, cap {})",
            config.pool_name, config.thread_limit, config.thread_cap
        );
        ThreadPool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    thread_limit: config.thread_limit,
                    threads: 0,
                    idle: 0,
                    shutting_down: false,
                }),
                cvar: Condvar::new(),
                listener,
                baseline: config.thread_limit,
                idle_limit: config.idle_thread_limit,
                cap: config.thread_cap,
                name: config.pool_name.clone(),
                next_thread_index: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Submit a work item. Fails with `DispatchFailed` once the pool has
    /// been shut down or if a needed thread cannot be spawned.
    pub fn submit(&self, item: WorkItem) -> Result<(), SchedulerError> {
        let need_spawn = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                return Err(SchedulerError::DispatchFailed);
            }
            let need_spawn = state.idle == 0 && state.threads < state.thread_limit;
            if need_spawn {
                state.threads += 1;
            }
            need_spawn
        };

        if need_spawn && !self.spawn_thread() {
            let mut state = self.shared.state.lock().unwrap();
            state.threads -= 1;
            return Err(SchedulerError::DispatchFailed);
        }

        let mut state = self.shared.state.lock().unwrap();
        if state.shutting_down {
            return Err(SchedulerError::DispatchFailed);
        }
        state.queue.push_back(item);
        if state.idle > 0 {
            self.shared.cvar.notify_one();
        }
        Ok(())
    }

    /// Current thread limit.
    pub fn thread_limit(&self) -> usize {
        self.shared.state.lock().unwrap().thread_limit
    }

    /// Number of live pool threads, busy or idle.
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().unwrap().threads
    }

    /// Baseline thread limit the pool was created with.
    pub fn baseline(&self) -> usize {
        self.shared.baseline
    }

    /// Set the thread limit directly, clamped to `[baseline, cap]`.
    /// Lowering the limit wakes idle threads so excess threads exit.
    pub fn set_thread_limit(&self, limit: usize) {
        let limit = limit.clamp(self.shared.baseline, self.shared.cap);
        let mut state = self.shared.state.lock().unwrap();
        state.thread_limit = limit;
        self.shared.cvar.notify_all();
    }

    /// Borrow one slot of extra capacity, raising the thread limit by one.
    ///
    /// Returns `None` once the hard cap is reached; callers must treat that
    /// as "proceed without extra capacity", not as a fatal error. The
    /// returned token performs the matching decrement when dropped.
    pub fn borrow_thread(&self) -> Option<CapacityToken> {
        let need_spawn = {
            let mut state = self.shared.state.lock().unwrap();
            if state.thread_limit + 1 > self.shared.cap {
                warn!("thread pool '{}' cap reached", self.shared.name);
                return None;
            }
            state.thread_limit += 1;
            let need_spawn =
                !state.queue.is_empty() && state.idle == 0 && state.threads < state.thread_limit;
            if need_spawn {
                state.threads += 1;
            }
            need_spawn
        };
        if need_spawn && !self.spawn_thread() {
            let mut state = self.shared.state.lock().unwrap();
            state.threads -= 1;
        }
        Some(CapacityToken {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Stop accepting work, drop queued items, and join every pool thread.
    ///
    /// Must not be called from a pool thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
            self.shared.cvar.notify_all();
        }
        let handles = std::mem::take(&mut *self.shared.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("thread pool '{}' shut down", self.shared.name);
    }

    fn spawn_thread(&self) -> bool {
        let shared = Arc::clone(&self.shared);
        let index = shared.next_thread_index.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}#{}", shared.name, index);
        match thread::Builder::new()
            .name(name)
            .spawn(move || pool_thread_main(&shared))
        {
            Ok(handle) => {
                self.shared.handles.lock().unwrap().push(handle);
                true
            }
            Err(err) => {
                warn!("failed to spawn pool thread: {err}");
                false
            }
        }
    }
}

fn pool_thread_main(shared: &Arc<PoolShared>) {
    debug!("pool thread created");
    shared.listener.on_thread_created();

    while let Some(item) = next_item(shared) {
        item();
    }

    {
        let mut state = shared.state.lock().unwrap();
        state.threads -= 1;
    }
    shared.listener.on_thread_shutting_down();
    debug!("pool thread shutting down");
}

fn next_item(shared: &PoolShared) -> Option<WorkItem> {
    let mut state = shared.state.lock().unwrap();
    loop {
        // Over-limit threads exit as soon as they come back for work,
        // returning borrowed capacity to its baseline shape.
        if state.threads > state.thread_limit {
            return None;
        }
        if let Some(item) = state.queue.pop_front() {
            return Some(item);
        }
        if state.shutting_down {
            return None;
        }
        if state.idle >= shared.idle_limit {
            return None;
        }
        state.idle += 1;
        state = shared.cvar.wait(state).unwrap();
        state.idle -= 1;
    }
}

/// Token for one slot of borrowed pool capacity.
///
/// Dropping the token decrements the thread limit; holding it for the
/// duration of a blocking section keeps the extra slot open. Because the
/// decrement runs exactly once on drop, a borrow can never be returned
/// twice or leaked across an early exit path.
#[must_use = "dropping the token returns the borrowed capacity"]
pub struct CapacityToken {
    shared: Arc<PoolShared>,
}

impl CapacityToken {
    /// Explicitly return the borrowed capacity.
    pub fn release(self) {}
}

impl Drop for CapacityToken {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.thread_limit -= 1;
        debug_assert!(
            state.thread_limit >= self.shared.baseline,
            "thread limit fell below baseline: borrow/return imbalance"
        );
        // Wake idle threads so any now-excess thread can exit.
        self.shared.cvar.notify_all();
    }
}
