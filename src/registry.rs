//! Per-pool-thread runtime context slots.
//!
//! Rather than hiding contexts in platform thread-local storage, the
//! registry keeps an explicit slot map keyed by thread identity so context
//! lifetime stays visible: slots are populated from the pool's
//! thread-created hook and cleared from its thread-stopping hook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use log::{debug, error};

use crate::engine::{ContextHandle, EngineHandle};
use crate::pool::PoolListener;

#[derive(Default)]
pub struct ContextRegistry {
    slots: Mutex<HashMap<ThreadId, ContextHandle>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context owned by the calling thread, if one was created.
    pub fn current(&self) -> Option<ContextHandle> {
        self.slots
            .lock()
            .unwrap()
            .get(&thread::current().id())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_current(&self, context: ContextHandle) {
        let previous = self
            .slots
            .lock()
            .unwrap()
            .insert(thread::current().id(), context);
        debug_assert!(previous.is_none(), "thread already had a context slot");
    }

    fn remove_current(&self) {
        self.slots.lock().unwrap().remove(&thread::current().id());
    }
}

/// Pool lifecycle listener that fills and clears the registry.
pub(crate) struct ContextListener {
    engine: EngineHandle,
    registry: Arc<ContextRegistry>,
}

impl ContextListener {
    pub(crate) fn new(engine: EngineHandle, registry: Arc<ContextRegistry>) -> Self {
        ContextListener { engine, registry }
    }
}

impl PoolListener for ContextListener {
    fn on_thread_created(&self) {
        match self.engine.create_context() {
            Ok(context) => {
                debug!("runtime context created for pool thread");
                self.registry.insert_current(context);
            }
            // The slot stays empty; drains on this thread fail gracefully.
            Err(err) => error!("failed to create runtime context: {err}"),
        }
    }

    fn on_thread_shutting_down(&self) {
        debug!("dropping runtime context for exiting pool thread");
        self.registry.remove_current();
    }
}
