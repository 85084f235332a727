//! Revocation handles for batches of definitions.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dylib::{DylibInner, JitDylib};
use crate::error::OrcError;
use crate::session::SessionInner;

/// Stable identity of a [`ResourceTracker`] within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(u64);

impl ResourceKey {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TrackerState {
    removed: bool,
    /// Every dylib this tracker has defined into.
    dylibs: Vec<Weak<DylibInner>>,
}

pub(crate) struct TrackerInner {
    key: ResourceKey,
    home: Weak<DylibInner>,
    session: Weak<SessionInner>,
    state: Mutex<TrackerState>,
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.forget_tracker(self.key);
        }
    }
}

/// Scopes a batch of definitions so they can be revoked together.
///
/// Removal is atomic across every dylib the tracker defined into: all
/// affected tables are locked (in creation order) before any record is
/// dropped. Symbols that are materializing at that moment are cancelled;
/// their waiters fail with `SymbolNotFound` and the materializer's eventual
/// result is discarded.
#[derive(Clone)]
pub struct ResourceTracker(Arc<TrackerInner>);

impl ResourceTracker {
    pub(crate) fn new(
        key: ResourceKey,
        home: Weak<DylibInner>,
        session: Weak<SessionInner>,
    ) -> Self {
        ResourceTracker(Arc::new(TrackerInner {
            key,
            home,
            session,
            state: Mutex::new(TrackerState {
                removed: false,
                dylibs: Vec::new(),
            }),
        }))
    }

    pub(crate) fn downgrade(&self) -> Weak<TrackerInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(inner: &Weak<TrackerInner>) -> Option<ResourceTracker> {
        inner.upgrade().map(ResourceTracker)
    }

    pub fn key(&self) -> ResourceKey {
        self.0.key
    }

    /// The dylib this tracker was created for, while its session lives.
    pub fn dylib(&self) -> Option<JitDylib> {
        self.0.home.upgrade().map(JitDylib)
    }

    pub fn is_removed(&self) -> bool {
        self.0.state.lock().removed
    }

    /// Record that `dylib` holds definitions owned by this tracker.
    ///
    /// Called with the dylib's table locked.
    pub(crate) fn attach(&self, dylib: &JitDylib) -> Result<(), OrcError> {
        let mut state = self.0.state.lock();
        if state.removed {
            return Err(OrcError::AlreadyRemoved { key: self.0.key });
        }
        let target = Arc::downgrade(&dylib.0);
        if !state.dylibs.iter().any(|known| known.ptr_eq(&target)) {
            state.dylibs.push(target);
        }
        Ok(())
    }

    /// Remove every definition owned by this tracker.
    pub fn remove(&self) -> Result<(), OrcError> {
        let dylibs = {
            let mut state = self.0.state.lock();
            if state.removed {
                return Err(OrcError::AlreadyRemoved { key: self.0.key });
            }
            state.removed = true;
            std::mem::take(&mut state.dylibs)
        };
        let dylibs = lock_order(&dylibs);
        let mut graveyard = Vec::new();
        let mut removed = 0;
        {
            let mut tables: Vec<_> = dylibs.iter().map(|dylib| dylib.state.lock()).collect();
            for table in &mut tables {
                removed += table.purge_tracker(self.0.key, &mut graveyard);
            }
        }
        // Pending units may own arbitrary captured state; drop it unlocked.
        drop(graveyard);
        tracing::debug!(tracker = %self.0.key, symbols = removed, "removed resource tracker");
        Ok(())
    }

    /// Move ownership of everything this tracker owns to `dst`.
    pub fn transfer_to(&self, dst: &ResourceTracker) -> Result<(), OrcError> {
        if Arc::ptr_eq(&self.0, &dst.0) {
            return Ok(());
        }
        let dylibs = {
            let state = self.0.state.lock();
            if state.removed {
                return Err(OrcError::AlreadyRemoved { key: self.0.key });
            }
            state.dylibs.clone()
        };
        {
            let mut state = dst.0.state.lock();
            if state.removed {
                return Err(OrcError::AlreadyRemoved { key: dst.0.key });
            }
            for dylib in &dylibs {
                if !state.dylibs.iter().any(|known| known.ptr_eq(dylib)) {
                    state.dylibs.push(dylib.clone());
                }
            }
        }
        let dylibs = lock_order(&dylibs);
        let mut moved = 0;
        {
            let mut tables: Vec<_> = dylibs.iter().map(|dylib| dylib.state.lock()).collect();
            for table in &mut tables {
                moved += table.retag(self.0.key, dst.0.key);
            }
        }
        tracing::debug!(
            from = %self.0.key,
            to = %dst.0.key,
            symbols = moved,
            "transferred resource tracker"
        );
        Ok(())
    }
}

/// Live dylibs sorted by id, the global order in which tables are locked
/// together.
fn lock_order(dylibs: &[Weak<DylibInner>]) -> Vec<Arc<DylibInner>> {
    let mut live: Vec<_> = dylibs.iter().filter_map(Weak::upgrade).collect();
    live.sort_by_key(|dylib| dylib.id);
    live.dedup_by_key(|dylib| dylib.id);
    live
}

impl PartialEq for ResourceTracker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ResourceTracker {}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("key", &self.0.key)
            .field("removed", &self.is_removed())
            .finish()
    }
}
