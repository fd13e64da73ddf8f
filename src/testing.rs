//! Test doubles for the engine and fetcher seams, plus small helpers.
//!
//! Available to downstream crates through the `testing` feature so
//! embedders can exercise their scheduling logic without a real script
//! runtime or network stack.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use url::Url;

use crate::engine::{CompiledScript, ContextHandle, ExecutionAbort, RuntimeContext, ScriptEngine};
use crate::error::SchedulerError;
use crate::interrupt::{InterruptDisposition, InterruptPoint};
use crate::loader::{FetchCallback, FetchHandle, FetchOutcome, LoadPolicy, ScriptFetcher};
use crate::worker::Worker;

// ============================================================================
// Engine
// ============================================================================

struct MockState {
    events: Mutex<Vec<String>>,
    fail_attach: AtomicBool,
    fail_compile_marker: Mutex<Option<String>>,
    fail_execute_marker: Mutex<Option<String>>,
    spin_marker: Mutex<Option<String>>,
}

/// Scriptable engine double. All contexts created from one engine share
/// its event log and failure knobs.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        MockEngine {
            state: Arc::new(MockState {
                events: Mutex::new(Vec::new()),
                fail_attach: AtomicBool::new(false),
                fail_compile_marker: Mutex::new(None),
                fail_execute_marker: Mutex::new(None),
                spin_marker: Mutex::new(None),
            }),
        }
    }

    /// Refuse every global attach.
    pub fn fail_attach(&self) {
        self.state.fail_attach.store(true, Ordering::SeqCst);
    }

    /// Fail compilation of any source containing `marker`.
    pub fn fail_compile_containing(&self, marker: &str) {
        *self.state.fail_compile_marker.lock().unwrap() = Some(marker.to_string());
    }

    /// Fail execution of any script whose source contains `marker`.
    pub fn fail_execute_containing(&self, marker: &str) {
        *self.state.fail_execute_marker.lock().unwrap() = Some(marker.to_string());
    }

    /// Scripts whose source contains `marker` loop at their interrupt
    /// point until told to abort.
    pub fn spin_on(&self, marker: &str) {
        *self.state.spin_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for MockEngine {
    fn create_context(&self) -> Result<ContextHandle, SchedulerError> {
        Ok(Arc::new(MockContext {
            state: self.state.clone(),
        }))
    }
}

struct MockContext {
    state: Arc<MockState>,
}

impl MockContext {
    fn record(&self, event: impl Into<String>) {
        self.state.events.lock().unwrap().push(event.into());
    }

    fn marker_matches(marker: &Mutex<Option<String>>, source: &str) -> bool {
        marker
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|m| source.contains(m))
    }
}

impl RuntimeContext for MockContext {
    fn attach_global(&self, worker: &Arc<Worker>) -> Result<(), String> {
        if self.state.fail_attach.load(Ordering::SeqCst) {
            return Err("attach refused".to_string());
        }
        self.record(format!("attach:{}", worker.id()));
        Ok(())
    }

    fn detach_global(&self) {
        self.record("detach");
    }

    fn compile(&self, source: &str, name: &str) -> Result<Box<dyn CompiledScript>, String> {
        if Self::marker_matches(&self.state.fail_compile_marker, source) {
            return Err(format!("unexpected token in {name}"));
        }
        self.record(format!("compile:{name}"));
        Ok(Box::new(MockUnit {
            name: name.to_string(),
            source: source.to_string(),
        }))
    }

    fn execute(
        &self,
        script: &dyn CompiledScript,
        interrupt: &InterruptPoint,
    ) -> Result<(), ExecutionAbort> {
        let Some(unit) = script.as_any().downcast_ref::<MockUnit>() else {
            return Err(ExecutionAbort::Fault(
                "script was not compiled by this engine".to_string(),
            ));
        };
        self.record(format!("execute:{}", unit.name));
        if Self::marker_matches(&self.state.spin_marker, &unit.source) {
            loop {
                match interrupt.check() {
                    InterruptDisposition::Continue => thread::sleep(Duration::from_millis(1)),
                    InterruptDisposition::Abort => return Err(ExecutionAbort::Interrupted),
                }
            }
        }
        if Self::marker_matches(&self.state.fail_execute_marker, &unit.source) {
            return Err(ExecutionAbort::Fault(format!("{} threw", unit.name)));
        }
        Ok(())
    }
}

/// What MockContext::compile produces.
pub struct MockUnit {
    pub name: String,
    pub source: String,
}

impl CompiledScript for MockUnit {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Fetcher
// ============================================================================

struct FetcherState {
    scripts: Mutex<HashMap<String, (Duration, FetchOutcome)>>,
    fetches: AtomicUsize,
}

/// Fetcher double that serves scripted outcomes after a per-URL delay,
/// completing from its own thread the way a real transport would.
/// Unknown URLs complete with a 404. Cancelling a fetch cuts the delay
/// short and completes with status 0.
pub struct MockFetcher {
    state: Arc<FetcherState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        MockFetcher {
            state: Arc::new(FetcherState {
                scripts: Mutex::new(HashMap::new()),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn script(&self, url: &str, delay: Duration, outcome: FetchOutcome) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), (delay, outcome));
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptFetcher for MockFetcher {
    fn fetch(&self, url: &Url, on_complete: FetchCallback) -> Box<dyn FetchHandle> {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        let scripted = self.state.scripts.lock().unwrap().get(url.as_str()).cloned();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        thread::spawn(move || {
            let (delay, outcome) =
                scripted.unwrap_or_else(|| (Duration::ZERO, FetchOutcome::error(404)));
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline && !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            let outcome = if flag.load(Ordering::SeqCst) {
                FetchOutcome::error(0)
            } else {
                outcome
            };
            on_complete(outcome);
        });
        Box::new(MockFetchHandle { cancelled })
    }
}

struct MockFetchHandle {
    cancelled: Arc<AtomicBool>,
}

impl FetchHandle for MockFetchHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Policy and helpers
// ============================================================================

/// Policy that refuses any URL containing a substring.
pub struct BlockPolicy {
    needle: String,
}

impl BlockPolicy {
    pub fn blocking(needle: &str) -> Self {
        BlockPolicy {
            needle: needle.to_string(),
        }
    }
}

impl LoadPolicy for BlockPolicy {
    fn should_load(&self, url: &Url) -> bool {
        !url.as_str().contains(&self.needle)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return cond();
        }
        thread::sleep(Duration::from_millis(2));
    }
}
