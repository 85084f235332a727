use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use orcus_base::{SymbolStringPool, SymbolStringPtr};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{DispatchMode, SessionConfig};
use crate::dylib::JitDylib;
use crate::error::OrcError;
use crate::materialization::MaterializationTask;
use crate::resource_tracker::{ResourceKey, ResourceTracker, TrackerInner};

/// Session-wide id counters for dylibs and trackers.
pub(crate) struct IdAllocator {
    next_dylib: AtomicU64,
    next_tracker: AtomicU64,
}

impl IdAllocator {
    fn new() -> Self {
        Self {
            next_dylib: AtomicU64::new(0),
            next_tracker: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_dylib(&self) -> u64 {
        self.next_dylib.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_tracker(&self) -> ResourceKey {
        ResourceKey::new(self.next_tracker.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    pool: SymbolStringPool,
    open: AtomicBool,
    dylibs: RwLock<Vec<JitDylib>>,
    ids: Arc<IdAllocator>,
    /// Live trackers by key; entries leave when the tracker is dropped.
    trackers: Mutex<FxHashMap<ResourceKey, Weak<TrackerInner>>>,
}

impl SessionInner {
    pub(crate) fn register_tracker(&self, tracker: &ResourceTracker) {
        self.trackers
            .lock()
            .insert(tracker.key(), tracker.downgrade());
    }

    pub(crate) fn forget_tracker(&self, key: ResourceKey) {
        self.trackers.lock().remove(&key);
    }

    pub(crate) fn tracker(&self, key: ResourceKey) -> Option<ResourceTracker> {
        let tracker = self.trackers.lock().get(&key).and_then(ResourceTracker::upgrade);
        tracker
    }

    fn teardown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let dylibs = std::mem::take(&mut *self.dylibs.write());
        tracing::debug!(dylibs = dylibs.len(), "ending execution session");
        for dylib in &dylibs {
            dylib.close();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A running JIT program: the symbol string pool plus the registry of dylibs.
///
/// Handles are cheap to clone. The session ends when [`end_session`] is
/// called or the last handle is dropped; ending it fails every lookup still
/// waiting on a materialization with `SessionEnded` and releases all dylibs.
/// Generators and materializers that capture a session handle keep it alive
/// until `end_session` clears them, so long-lived JITs should end their
/// session explicitly.
///
/// [`end_session`]: ExecutionSession::end_session
#[derive(Clone)]
pub struct ExecutionSession(pub(crate) Arc<SessionInner>);

impl ExecutionSession {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        ExecutionSession(Arc::new(SessionInner {
            config,
            pool: SymbolStringPool::new(),
            open: AtomicBool::new(true),
            dylibs: RwLock::new(Vec::new()),
            ids: Arc::new(IdAllocator::new()),
            trackers: Mutex::new(FxHashMap::default()),
        }))
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        ExecutionSession(inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.0.config
    }

    pub fn symbol_string_pool(&self) -> &SymbolStringPool {
        &self.0.pool
    }

    pub fn intern(&self, name: &str) -> SymbolStringPtr {
        self.0.pool.intern(name)
    }

    pub fn is_open(&self) -> bool {
        self.0.open.load(Ordering::Acquire)
    }

    /// Create an empty dylib. Names are unique within the session.
    pub fn create_jit_dylib(&self, name: impl Into<String>) -> Result<JitDylib, OrcError> {
        let name = name.into();
        let mut dylibs = self.0.dylibs.write();
        if !self.is_open() {
            return Err(OrcError::SessionEnded);
        }
        if dylibs.iter().any(|dylib| dylib.name() == name) {
            return Err(OrcError::DuplicateDylib { name });
        }
        let dylib = JitDylib::new(
            name,
            Arc::downgrade(&self.0),
            self.0.pool.clone(),
            self.0.ids.clone(),
        );
        dylibs.push(dylib.clone());
        tracing::debug!(dylib = dylib.name(), "created JITDylib");
        Ok(dylib)
    }

    pub fn get_jit_dylib_by_name(&self, name: &str) -> Option<JitDylib> {
        self.0
            .dylibs
            .read()
            .iter()
            .find(|dylib| dylib.name() == name)
            .cloned()
    }

    /// Every live dylib, in creation order.
    pub fn jit_dylibs(&self) -> Vec<JitDylib> {
        self.0.dylibs.read().clone()
    }

    /// Fail pending materializations, then release every dylib.
    ///
    /// Idempotent. Later operations fail with `SessionEnded`.
    pub fn end_session(&self) {
        self.0.teardown();
    }

    /// The live tracker with `key`, if any handle to it remains.
    pub(crate) fn resource_tracker(&self, key: ResourceKey) -> Option<ResourceTracker> {
        self.0.tracker(key)
    }

    /// Run a claimed materialization according to the dispatch mode.
    pub(crate) fn dispatch(&self, task: MaterializationTask) {
        match self.0.config.dispatch {
            DispatchMode::InPlace => task.run(),
            DispatchMode::Threaded => {
                let thread_name = format!("orcus-materialize:{}", task.unit_name());
                // On spawn failure the task is dropped with the closure, which
                // fails its symbols through the responsibility.
                if let Err(err) = std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || task.run())
                {
                    tracing::warn!("failed to spawn materialization thread: {err}");
                }
            }
        }
    }

    /// Dump of every dylib, in creation order.
    pub fn dump(&self) -> String {
        self.jit_dylibs()
            .iter()
            .map(JitDylib::dump)
            .collect::<Vec<_>>()
            .join("")
    }
}

impl Default for ExecutionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("open", &self.is_open())
            .field("dylibs", &self.0.dylibs.read().len())
            .field("pool", &self.0.pool)
            .finish()
    }
}
