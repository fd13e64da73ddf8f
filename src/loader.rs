//! Script load pipeline.
//!
//! A load batch resolves and policy-checks every URL, issues all fetches
//! up front, then blocks its pool thread (with borrowed capacity) on the
//! load's own event queue. Fetch completions arrive on the fetcher's
//! thread, record into URL-ordered slots, and post compile events that
//! are processed back on the originating pool thread, because only that
//! thread holds the worker's context association. Execution happens last,
//! strictly in URL order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use bytes::Bytes;
use log::debug;
use url::Url;

use crate::engine::{CompiledScript, ContextHandle, ExecutionAbort};
use crate::error::SchedulerError;
use crate::interrupt::InterruptPoint;
use crate::limits::PoolConfig;
use crate::pool::ThreadPool;
use crate::worker::{CancellableLoad, Worker};

// ============================================================================
// External collaborators
// ============================================================================

/// What a finished fetch reports.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: u16,
    pub body: Bytes,
    /// Post-redirect URL, if it differs from the requested one.
    pub final_url: Option<Url>,
}

impl FetchOutcome {
    pub fn ok(body: impl AsRef<[u8]>) -> Self {
        FetchOutcome {
            status: 200,
            body: Bytes::copy_from_slice(body.as_ref()),
            final_url: None,
        }
    }

    pub fn error(status: u16) -> Self {
        FetchOutcome {
            status,
            body: Bytes::new(),
            final_url: None,
        }
    }
}

/// Completion callback handed to the fetcher; invoked on whatever thread
/// the transport completes on.
pub type FetchCallback = Box<dyn FnOnce(FetchOutcome) + Send>;

/// Handle to one in-flight fetch.
///
/// `cancel` must be idempotent and a no-op after completion. A cancelled
/// fetch must still invoke its completion callback (with a failure
/// status) unless the callback already ran; the pipeline counts on every
/// issued fetch eventually reporting.
pub trait FetchHandle: Send + Sync {
    fn cancel(&self);
}

/// Asynchronous script source provider. The pipeline does not know how
/// fetches are transported.
pub trait ScriptFetcher: Send + Sync {
    fn fetch(&self, url: &Url, on_complete: FetchCallback) -> Box<dyn FetchHandle>;
}

/// Load policy applied to every resolved script URL before its fetch is
/// issued.
pub trait LoadPolicy: Send + Sync {
    fn should_load(&self, url: &Url) -> bool;
}

/// Policy that accepts everything.
pub struct AllowAllPolicy;

impl LoadPolicy for AllowAllPolicy {
    fn should_load(&self, _url: &Url) -> bool {
        true
    }
}

/// Arc wrapper for ScriptFetcher trait objects.
pub type FetcherHandle = Arc<dyn ScriptFetcher>;

/// Arc wrapper for LoadPolicy trait objects.
pub type PolicyHandle = Arc<dyn LoadPolicy>;

// ============================================================================
// Load state
// ============================================================================

/// Per-script record, fixed to its URL-order slot for the whole batch.
struct ScriptLoadInfo {
    url: Url,
    status: u16,
    body: Option<Bytes>,
    unit: Option<Box<dyn CompiledScript>>,
    done: bool,
    failure: Option<SchedulerError>,
}

impl ScriptLoadInfo {
    fn new(url: Url) -> Self {
        ScriptLoadInfo {
            url,
            status: 0,
            body: None,
            unit: None,
            done: false,
            failure: None,
        }
    }
}

enum LoaderEvent {
    /// Fetch for slot `index` has recorded its outcome.
    Fetched(usize),
    /// Stop waiting immediately (cancellation).
    Done,
}

struct LoaderShared {
    worker: Arc<Worker>,
    infos: Mutex<Vec<ScriptLoadInfo>>,
    handles: Mutex<Vec<Box<dyn FetchHandle>>>,
    cancelled: AtomicBool,
    /// Set on the first fetch/compile failure; suppresses further compiles
    /// and cancels the outstanding fetches.
    failed: AtomicBool,
    events: Mutex<Option<mpsc::Sender<LoaderEvent>>>,
}

impl LoaderShared {
    fn post(&self, event: LoaderEvent) {
        if let Some(tx) = &*self.events.lock().unwrap() {
            let _ = tx.send(event);
        }
    }

    /// Invoked from the fetcher's completion thread.
    fn record_outcome(&self, index: usize, outcome: FetchOutcome) {
        let mut infos = self.infos.lock().unwrap();
        let slot = &mut infos[index];
        if slot.done {
            // Cancellation already settled this slot.
            return;
        }
        slot.done = true;
        slot.status = outcome.status;
        slot.body = Some(outcome.body);
        if let Some(final_url) = outcome.final_url {
            // Report errors against what the fetch actually resolved to.
            slot.url = final_url;
        }
    }
}

impl CancellableLoad for LoaderShared {
    fn cancel_load(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("cancelling script load for {}", self.worker.id());
        for handle in self.handles.lock().unwrap().iter() {
            handle.cancel();
        }
        {
            let mut infos = self.infos.lock().unwrap();
            for slot in infos.iter_mut() {
                if !slot.done {
                    slot.done = true;
                    slot.failure = Some(SchedulerError::Cancelled);
                }
            }
        }
        // Wake the blocked pool thread now rather than waiting for
        // network teardown.
        self.post(LoaderEvent::Done);
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// One batch load of scripts for one worker. Single use.
pub struct ScriptLoader {
    shared: Arc<LoaderShared>,
    pool: ThreadPool,
    fetcher: FetcherHandle,
    policy: PolicyHandle,
    config: PoolConfig,
}

impl ScriptLoader {
    pub(crate) fn new(
        worker: Arc<Worker>,
        pool: ThreadPool,
        fetcher: FetcherHandle,
        policy: PolicyHandle,
        config: PoolConfig,
    ) -> Self {
        ScriptLoader {
            shared: Arc::new(LoaderShared {
                worker,
                infos: Mutex::new(Vec::new()),
                handles: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                events: Mutex::new(None),
            }),
            pool,
            fetcher,
            policy,
            config,
        }
    }

    /// Fetch every URL, compile each script, and execute them in URL
    /// order against the worker's global. Runs on the worker's pool
    /// thread and blocks it until the batch settles.
    pub(crate) fn load_and_run(
        &self,
        cx: &ContextHandle,
        urls: &[&str],
    ) -> Result<(), SchedulerError> {
        if urls.is_empty() {
            return Err(SchedulerError::InvalidUrl { url: String::new() });
        }
        if self.shared.worker.is_cancelled() || self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(SchedulerError::Cancelled);
        }

        // Resolve and policy-check the whole batch before issuing
        // anything.
        let mut resolved = Vec::with_capacity(urls.len());
        for raw in urls {
            let url = self
                .shared
                .worker
                .base_url()
                .join(raw)
                .map_err(|_| SchedulerError::InvalidUrl {
                    url: (*raw).to_string(),
                })?;
            if !self.policy.should_load(&url) {
                return Err(SchedulerError::Blocked {
                    url: url.to_string(),
                });
            }
            resolved.push(url);
        }
        {
            let mut infos = self.shared.infos.lock().unwrap();
            *infos = resolved.into_iter().map(ScriptLoadInfo::new).collect();
        }

        // Track the load on the worker so cancelling the worker reaches a
        // load that is blocking this thread.
        let as_load: Arc<dyn CancellableLoad> = self.shared.clone();
        let weak = Arc::downgrade(&as_load);
        self.shared.worker.register_load(weak.clone());
        let result = self.run_batch(cx, urls.len());
        self.shared.worker.deregister_load(&weak);
        result
    }

    fn run_batch(&self, cx: &ContextHandle, count: usize) -> Result<(), SchedulerError> {
        let (tx, rx) = mpsc::channel();
        *self.shared.events.lock().unwrap() = Some(tx.clone());

        // Issue every fetch before awaiting any of them.
        for index in 0..count {
            let url = self.shared.infos.lock().unwrap()[index].url.clone();
            debug!("fetching script {url} for {}", self.shared.worker.id());
            let shared = Arc::clone(&self.shared);
            let event_tx = tx.clone();
            let handle = self.fetcher.fetch(
                &url,
                Box::new(move |outcome| {
                    shared.record_outcome(index, outcome);
                    let _ = event_tx.send(LoaderEvent::Fetched(index));
                }),
            );
            self.shared.handles.lock().unwrap().push(handle);
        }

        // This thread is about to block on fetch completion; open a slot
        // for other workers while it does.
        let borrow = self.pool.borrow_thread();
        let mut remaining = count;
        while remaining > 0 && !self.shared.cancelled.load(Ordering::SeqCst) {
            match rx.recv() {
                Ok(LoaderEvent::Fetched(index)) => {
                    self.process_fetched(cx, index);
                    remaining -= 1;
                }
                Ok(LoaderEvent::Done) | Err(_) => break,
            }
        }
        drop(borrow);

        // Dropping the receiver revokes any compile event still queued.
        *self.shared.events.lock().unwrap() = None;
        drop(rx);
        self.shared.handles.lock().unwrap().clear();

        if self.shared.cancelled.load(Ordering::SeqCst) || self.shared.worker.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        self.verify()?;
        self.execute_all(cx)
    }

    /// Settle one completed fetch and compile it into its slot. Runs on
    /// the originating pool thread.
    fn process_fetched(&self, cx: &ContextHandle, index: usize) {
        let pending = {
            let mut infos = self.shared.infos.lock().unwrap();
            let slot = &mut infos[index];
            if slot.failure.is_some() {
                None
            } else if self.shared.failed.load(Ordering::SeqCst) {
                // Pre-empted by an earlier failure in the batch.
                slot.failure = Some(SchedulerError::Cancelled);
                None
            } else if !(200..300).contains(&slot.status) {
                slot.failure = Some(SchedulerError::Fetch {
                    url: slot.url.to_string(),
                    status: slot.status,
                });
                self.shared.failed.store(true, Ordering::SeqCst);
                None
            } else {
                let body = slot.body.take().unwrap_or_default();
                match String::from_utf8(body.to_vec()) {
                    Ok(text) => Some((slot.url.clone(), text)),
                    Err(_) => {
                        slot.failure = Some(SchedulerError::Compile {
                            url: slot.url.to_string(),
                            message: "script source is not valid utf-8".to_string(),
                        });
                        self.shared.failed.store(true, Ordering::SeqCst);
                        None
                    }
                }
            }
        };

        let Some((url, text)) = pending else {
            if self.shared.failed.load(Ordering::SeqCst) {
                self.cancel_outstanding();
            }
            return;
        };

        match cx.compile(&text, url.as_str()) {
            Ok(unit) => {
                self.shared.infos.lock().unwrap()[index].unit = Some(unit);
            }
            Err(message) => {
                self.shared.infos.lock().unwrap()[index].failure = Some(SchedulerError::Compile {
                    url: url.to_string(),
                    message,
                });
                self.shared.failed.store(true, Ordering::SeqCst);
                self.cancel_outstanding();
            }
        }
    }

    /// Once the batch has failed, the remaining fetches are moot.
    fn cancel_outstanding(&self) {
        for handle in self.shared.handles.lock().unwrap().iter() {
            handle.cancel();
        }
    }

    /// Report the first failure in URL order. Slots settled as
    /// `Cancelled` were pre-empted by the failure being reported and are
    /// skipped.
    fn verify(&self) -> Result<(), SchedulerError> {
        let infos = self.shared.infos.lock().unwrap();
        for slot in infos.iter() {
            debug_assert!(slot.done, "verifying a load that never completed");
            match &slot.failure {
                Some(SchedulerError::Cancelled) => continue,
                Some(err) => return Err(err.clone()),
                None => debug_assert!(slot.unit.is_some(), "fetched script was never compiled"),
            }
        }
        Ok(())
    }

    fn execute_all(&self, cx: &ContextHandle) -> Result<(), SchedulerError> {
        let units: Vec<(Url, Box<dyn CompiledScript>)> = {
            let mut infos = self.shared.infos.lock().unwrap();
            infos
                .iter_mut()
                .filter_map(|slot| slot.unit.take().map(|unit| (slot.url.clone(), unit)))
                .collect()
        };

        let interrupt = InterruptPoint::new(
            self.shared.worker.clone(),
            self.pool.clone(),
            &self.config,
        );
        for (url, unit) in &units {
            debug!("executing script {url} for {}", self.shared.worker.id());
            cx.execute(unit.as_ref(), &interrupt)
                .map_err(|abort| match abort {
                    ExecutionAbort::Interrupted => SchedulerError::Cancelled,
                    ExecutionAbort::Fault(message) => SchedulerError::Execute { message },
                })?;
        }
        Ok(())
    }
}
