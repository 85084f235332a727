//! JIT dylibs: named symbol tables with an ordered list of generators.

use std::fmt::{self, Write as _};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use orcus_base::{EvaluatedSymbol, ExecutorAddr, JitSymbolFlags, SymbolStringPool, SymbolStringPtr};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::OrcError;
use crate::generators::{DefinitionGenerator, FnGenerator};
use crate::lookup::{JitDylibLookupFlags, LookupKind};
use crate::materialization::{
    Materializer, MaterializationResponsibility, MaterializationTask, MaterializationUnit,
    PendingSymbol, Settlement, SymbolFlagsMap, UnitBody,
};
use crate::resource_tracker::{ResourceKey, ResourceTracker};
use crate::session::{ExecutionSession, IdAllocator, SessionInner};

/// Where a symbol record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolState {
    /// Defined by a deferred unit that has not been asked for yet.
    Declared,
    Materializing,
    Resolved,
    /// The materializer reported failure; the record stays poisoned.
    Failed,
}

impl fmt::Display for SymbolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SymbolState::Declared => "Declared",
            SymbolState::Materializing => "Materializing",
            SymbolState::Resolved => "Resolved",
            SymbolState::Failed => "Failed",
        };
        f.write_str(text)
    }
}

enum EntryState {
    Declared { unit: u64 },
    Materializing(Arc<PendingSymbol>),
    Resolved(ExecutorAddr),
    Failed(OrcError),
}

struct SymbolTableEntry {
    tracker: ResourceKey,
    flags: JitSymbolFlags,
    state: EntryState,
}

impl SymbolTableEntry {
    fn state(&self) -> SymbolState {
        match self.state {
            EntryState::Declared { .. } => SymbolState::Declared,
            EntryState::Materializing(_) => SymbolState::Materializing,
            EntryState::Resolved(_) => SymbolState::Resolved,
            EntryState::Failed(_) => SymbolState::Failed,
        }
    }
}

/// A deferred unit that no lookup has triggered yet.
pub(crate) struct PendingUnit {
    name: String,
    tracker: ResourceKey,
    symbols: SymbolFlagsMap,
    materialize: Materializer,
}

pub(crate) struct DylibState {
    open: bool,
    symbols: FxHashMap<SymbolStringPtr, SymbolTableEntry>,
    units: FxHashMap<u64, PendingUnit>,
    next_unit: u64,
}

impl DylibState {
    /// Drop every record owned by `key`. Waiters on in-flight symbols are
    /// settled with `SymbolNotFound`; detached units go to `graveyard` so they
    /// can be dropped after the lock is released.
    pub(crate) fn purge_tracker(
        &mut self,
        key: ResourceKey,
        graveyard: &mut Vec<PendingUnit>,
    ) -> usize {
        let doomed: Vec<SymbolStringPtr> = self
            .symbols
            .iter()
            .filter(|(_, entry)| entry.tracker == key)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            if let Some(SymbolTableEntry {
                state: EntryState::Materializing(pending),
                ..
            }) = self.symbols.remove(name)
            {
                pending.settle(Err(OrcError::symbol_not_found(name.as_str())));
            }
        }
        let units: Vec<u64> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.tracker == key)
            .map(|(id, _)| *id)
            .collect();
        graveyard.extend(units.iter().filter_map(|id| self.units.remove(id)));
        doomed.len()
    }

    pub(crate) fn retag(&mut self, from: ResourceKey, to: ResourceKey) -> usize {
        let mut moved = 0;
        for entry in self.symbols.values_mut().filter(|entry| entry.tracker == from) {
            entry.tracker = to;
            moved += 1;
        }
        for unit in self.units.values_mut().filter(|unit| unit.tracker == from) {
            unit.tracker = to;
        }
        moved
    }

    /// Close the table for good, failing in-flight waiters with
    /// `SessionEnded`.
    fn close(&mut self, graveyard: &mut Vec<PendingUnit>) {
        self.open = false;
        for (_, entry) in self.symbols.drain() {
            if let EntryState::Materializing(pending) = entry.state {
                pending.settle(Err(OrcError::SessionEnded));
            }
        }
        graveyard.extend(self.units.drain().map(|(_, unit)| unit));
    }
}

/// Result of inspecting a dylib's table for one name.
pub(crate) enum Probe {
    Missing,
    /// A record exists but the lookup flags exclude it.
    Hidden,
    Ready(EvaluatedSymbol),
    Wait(Arc<PendingSymbol>),
    /// This lookup claimed a deferred unit and must dispatch it.
    Materialize {
        task: MaterializationTask,
        pending: Arc<PendingSymbol>,
    },
}

/// Marks a name whose generators are running, so concurrent misses for the
/// same name wait for that run instead of starting their own.
pub(crate) struct GeneratorRun {
    owner: ThreadId,
    finished: Mutex<bool>,
    done: Condvar,
}

impl GeneratorRun {
    pub(crate) fn wait(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.done.wait(&mut finished);
        }
    }

    fn finish(&self) {
        *self.finished.lock() = true;
        self.done.notify_all();
    }
}

pub(crate) enum GenerationClaim {
    /// This thread runs the generators for the name.
    Claimed(GenerationTurn),
    /// Another thread is running them; wait, then probe again.
    InFlight(Arc<GeneratorRun>),
    /// A generator on this thread asked for the name it is generating.
    Nested,
}

/// Releases a claimed name on drop and wakes the threads waiting on it.
pub(crate) struct GenerationTurn {
    dylib: JitDylib,
    name: SymbolStringPtr,
    run: Arc<GeneratorRun>,
}

impl Drop for GenerationTurn {
    fn drop(&mut self) {
        {
            let mut running = self.dylib.0.generating.lock();
            if running
                .get(&self.name)
                .is_some_and(|run| Arc::ptr_eq(run, &self.run))
            {
                running.remove(&self.name);
            }
        }
        self.run.finish();
    }
}

pub(crate) struct DylibInner {
    pub(crate) id: u64,
    name: String,
    session: Weak<SessionInner>,
    pool: SymbolStringPool,
    ids: Arc<IdAllocator>,
    pub(crate) state: Mutex<DylibState>,
    generators: RwLock<Vec<Arc<dyn DefinitionGenerator>>>,
    generating: Mutex<FxHashMap<SymbolStringPtr, Arc<GeneratorRun>>>,
    default_tracker: Mutex<Option<ResourceTracker>>,
}

/// A named symbol namespace within an [`ExecutionSession`].
///
/// Handles are cheap to clone and compare by identity. Once the session ends
/// the dylib is defunct: its name stays readable, everything else fails with
/// `SessionEnded` or reports nothing.
#[derive(Clone)]
pub struct JitDylib(pub(crate) Arc<DylibInner>);

impl JitDylib {
    pub(crate) fn new(
        name: String,
        session: Weak<SessionInner>,
        pool: SymbolStringPool,
        ids: Arc<IdAllocator>,
    ) -> Self {
        JitDylib(Arc::new(DylibInner {
            id: ids.next_dylib(),
            name,
            session,
            pool,
            ids,
            state: Mutex::new(DylibState {
                open: true,
                symbols: FxHashMap::default(),
                units: FxHashMap::default(),
                next_unit: 0,
            }),
            generators: RwLock::new(Vec::new()),
            generating: Mutex::new(FxHashMap::default()),
            default_tracker: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<ExecutionSession> {
        self.0.session.upgrade().map(ExecutionSession::from_inner)
    }

    /// Append a generator to the consult list.
    pub fn add_generator<G>(&self, generator: G)
    where
        G: DefinitionGenerator + 'static,
    {
        self.0.generators.write().push(Arc::new(generator));
    }

    /// Append a closure generator to the consult list.
    pub fn add_generator_fn<F>(&self, generate: F)
    where
        F: Fn(
                LookupKind,
                &JitDylib,
                JitDylibLookupFlags,
                &[SymbolStringPtr],
            ) -> Result<(), OrcError>
            + Send
            + Sync
            + 'static,
    {
        self.add_generator(FnGenerator::new(generate));
    }

    pub fn generator_count(&self) -> usize {
        self.0.generators.read().len()
    }

    pub(crate) fn generators(&self) -> Vec<Arc<dyn DefinitionGenerator>> {
        self.0.generators.read().clone()
    }

    pub fn create_resource_tracker(&self) -> ResourceTracker {
        let tracker = ResourceTracker::new(
            self.0.ids.next_tracker(),
            Arc::downgrade(&self.0),
            self.0.session.clone(),
        );
        if let Some(session) = self.0.session.upgrade() {
            session.register_tracker(&tracker);
        }
        tracker
    }

    /// The tracker used for definitions that do not name one. A fresh tracker
    /// takes its place once it has been removed.
    pub fn default_resource_tracker(&self) -> ResourceTracker {
        let mut slot = self.0.default_tracker.lock();
        match slot.as_ref() {
            Some(tracker) if !tracker.is_removed() => tracker.clone(),
            _ => {
                let tracker = self.create_resource_tracker();
                *slot = Some(tracker.clone());
                tracker
            }
        }
    }

    /// Install every symbol of `unit` under `tracker`, or none of them.
    ///
    /// Names must come from this session's string pool; a name interned
    /// elsewhere could never be found by a lookup and is rejected with
    /// `ForeignSymbol`.
    pub fn define(
        &self,
        tracker: &ResourceTracker,
        unit: MaterializationUnit,
    ) -> Result<(), OrcError> {
        let (unit_name, symbols, body) = unit.into_parts();
        if let Some(foreign) = symbols.keys().filter(|name| !self.0.pool.owns(name)).min() {
            return Err(OrcError::ForeignSymbol {
                name: foreign.to_string(),
            });
        }
        if symbols.is_empty() {
            if tracker.is_removed() {
                return Err(OrcError::AlreadyRemoved { key: tracker.key() });
            }
            return Ok(());
        }
        // Declared after `body` so the guard is released before a rejected
        // unit's callback is dropped.
        let mut state = self.0.state.lock();
        if !state.open {
            return Err(OrcError::SessionEnded);
        }
        tracker.attach(self)?;
        if let Some(duplicate) = symbols
            .keys()
            .filter(|name| state.symbols.contains_key(*name))
            .min()
        {
            return Err(OrcError::DuplicateDefinition {
                dylib: self.name().to_string(),
                name: duplicate.to_string(),
            });
        }
        let key = tracker.key();
        let count = symbols.len();
        match body {
            UnitBody::Absolute(resolved) => {
                for (name, symbol) in resolved {
                    state.symbols.insert(
                        name,
                        SymbolTableEntry {
                            tracker: key,
                            flags: symbol.flags(),
                            state: EntryState::Resolved(symbol.address()),
                        },
                    );
                }
            }
            UnitBody::Deferred(materialize) => {
                let unit = state.next_unit;
                state.next_unit += 1;
                for (name, flags) in &symbols {
                    state.symbols.insert(
                        name.clone(),
                        SymbolTableEntry {
                            tracker: key,
                            flags: *flags,
                            state: EntryState::Declared { unit },
                        },
                    );
                }
                state.units.insert(
                    unit,
                    PendingUnit {
                        name: unit_name.clone(),
                        tracker: key,
                        symbols,
                        materialize,
                    },
                );
            }
        }
        tracing::debug!(
            dylib = self.name(),
            unit = %unit_name,
            tracker = %key,
            symbols = count,
            "defined materialization unit"
        );
        Ok(())
    }

    pub fn symbol_state(&self, name: &SymbolStringPtr) -> Option<SymbolState> {
        self.0.state.lock().symbols.get(name).map(SymbolTableEntry::state)
    }

    pub fn contains(&self, name: &SymbolStringPtr) -> bool {
        self.0.state.lock().symbols.contains_key(name)
    }

    /// The tracker currently owning `name`.
    pub fn owner_of(&self, name: &SymbolStringPtr) -> Option<ResourceKey> {
        self.0.state.lock().symbols.get(name).map(|entry| entry.tracker)
    }

    pub fn len(&self) -> usize {
        self.0.state.lock().symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn probe(
        &self,
        name: &SymbolStringPtr,
        flags: JitDylibLookupFlags,
    ) -> Result<Probe, OrcError> {
        let mut guard = self.0.state.lock();
        let state = &mut *guard;
        if !state.open {
            return Err(OrcError::SessionEnded);
        }
        let Some(entry) = state.symbols.get(name) else {
            return Ok(Probe::Missing);
        };
        if flags == JitDylibLookupFlags::MatchExportedSymbolsOnly && !entry.flags.is_exported() {
            return Ok(Probe::Hidden);
        }
        let unit = match &entry.state {
            EntryState::Resolved(address) => {
                return Ok(Probe::Ready(EvaluatedSymbol::new(*address, entry.flags)));
            }
            EntryState::Failed(err) => return Err(err.clone()),
            EntryState::Materializing(pending) => return Ok(Probe::Wait(pending.clone())),
            EntryState::Declared { unit } => *unit,
        };
        let Some(unit) = state.units.remove(&unit) else {
            return Err(OrcError::materialization(
                name.as_str(),
                Arc::from("declared symbol has no materialization unit"),
            ));
        };
        let ours = PendingSymbol::new();
        let mut pending = FxHashMap::default();
        for unit_symbol in unit.symbols.keys() {
            let slot = if unit_symbol == name {
                ours.clone()
            } else {
                PendingSymbol::new()
            };
            if let Some(entry) = state.symbols.get_mut(unit_symbol) {
                entry.state = EntryState::Materializing(slot.clone());
            }
            pending.insert(unit_symbol.clone(), slot);
        }
        tracing::debug!(
            dylib = self.name(),
            unit = %unit.name,
            trigger = name.as_str(),
            "starting materialization"
        );
        let responsibility = MaterializationResponsibility::new(
            self.clone(),
            unit.tracker,
            unit.name,
            unit.symbols,
            pending,
        );
        Ok(Probe::Materialize {
            task: MaterializationTask::new(unit.materialize, responsibility),
            pending: ours,
        })
    }

    /// The tracker owning `name`, provided its record is still resolved to
    /// `address`.
    pub(crate) fn resolved_owner(
        &self,
        name: &SymbolStringPtr,
        address: ExecutorAddr,
    ) -> Option<ResourceKey> {
        match self.0.state.lock().symbols.get(name) {
            Some(SymbolTableEntry {
                tracker,
                state: EntryState::Resolved(current),
                ..
            }) if *current == address => Some(*tracker),
            _ => None,
        }
    }

    /// Take the turn to run generators for `name`.
    pub(crate) fn claim_generation(&self, name: &SymbolStringPtr) -> GenerationClaim {
        let me = thread::current().id();
        let mut running = self.0.generating.lock();
        if let Some(run) = running.get(name) {
            if run.owner == me {
                return GenerationClaim::Nested;
            }
            return GenerationClaim::InFlight(run.clone());
        }
        let run = Arc::new(GeneratorRun {
            owner: me,
            finished: Mutex::new(false),
            done: Condvar::new(),
        });
        running.insert(name.clone(), run.clone());
        GenerationClaim::Claimed(GenerationTurn {
            dylib: self.clone(),
            name: name.clone(),
            run,
        })
    }

    /// Whether `name` is still resolved to `address`. Used by waiters after
    /// they wake, since a removal may have run in between.
    pub(crate) fn confirm_resolved(
        &self,
        name: &SymbolStringPtr,
        address: ExecutorAddr,
    ) -> Result<bool, OrcError> {
        let state = self.0.state.lock();
        if !state.open {
            return Err(OrcError::SessionEnded);
        }
        let resolved = match state.symbols.get(name) {
            Some(SymbolTableEntry {
                state: EntryState::Resolved(current),
                ..
            }) => *current == address,
            _ => false,
        };
        Ok(resolved)
    }

    /// Apply materializer results. A settlement whose record is gone, or was
    /// replaced by a newer definition, is discarded.
    pub(crate) fn commit(
        &self,
        tracker: ResourceKey,
        settlements: Vec<Settlement>,
    ) -> Result<(), OrcError> {
        let mut state = self.0.state.lock();
        let mut discarded = 0usize;
        for Settlement {
            name,
            pending,
            outcome,
        } in settlements
        {
            let entry = state.symbols.get_mut(&name).filter(|entry| match &entry.state {
                EntryState::Materializing(current) => Arc::ptr_eq(current, &pending),
                _ => false,
            });
            let Some(entry) = entry else {
                discarded += 1;
                continue;
            };
            match outcome {
                Ok(address) => {
                    entry.state = EntryState::Resolved(address);
                    pending.settle(Ok(EvaluatedSymbol::new(address, entry.flags)));
                }
                Err(err) => {
                    entry.state = EntryState::Failed(err.clone());
                    pending.settle(Err(err));
                }
            }
        }
        if discarded == 0 {
            return Ok(());
        }
        let err = if state.open {
            OrcError::AlreadyRemoved { key: tracker }
        } else {
            OrcError::SessionEnded
        };
        drop(state);
        tracing::warn!(
            dylib = self.name(),
            tracker = %tracker,
            discarded,
            "discarding late materialization results: {err}"
        );
        Err(err)
    }

    /// Tear the dylib down as part of ending its session.
    pub(crate) fn close(&self) {
        let mut graveyard = Vec::new();
        self.0.state.lock().close(&mut graveyard);
        let generators = std::mem::take(&mut *self.0.generators.write());
        let default_tracker = self.0.default_tracker.lock().take();
        drop(graveyard);
        drop(generators);
        drop(default_tracker);
    }

    /// Human-readable listing of the table, sorted by symbol name.
    pub fn dump(&self) -> String {
        let state = self.0.state.lock();
        let mut entries: Vec<_> = state.symbols.iter().collect();
        entries.sort_by(|(left, _), (right, _)| left.cmp(right));
        let mut out = String::new();
        let _ = writeln!(
            out,
            "JITDylib \"{}\" (generators: {})",
            self.name(),
            self.generator_count()
        );
        for (name, entry) in entries {
            let _ = write!(out, "  {name}: {}", entry.state());
            if let EntryState::Resolved(address) = &entry.state {
                let _ = write!(out, " {address}");
            }
            let _ = writeln!(out, " [{}] tracker={}", entry.flags, entry.tracker);
        }
        out
    }
}

impl PartialEq for JitDylib {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for JitDylib {}

impl fmt::Debug for JitDylib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitDylib")
            .field("name", &self.0.name)
            .field("id", &self.0.id)
            .finish_non_exhaustive()
    }
}
