//! Materialization units and the responsibility handed to their callbacks.

use std::fmt;
use std::sync::Arc;

use orcus_base::{EvaluatedSymbol, ExecutorAddr, JitSymbolFlags, SymbolStringPtr};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::dylib::JitDylib;
use crate::error::OrcError;
use crate::resource_tracker::ResourceKey;

pub type SymbolMap = FxHashMap<SymbolStringPtr, EvaluatedSymbol>;
pub type SymbolFlagsMap = FxHashMap<SymbolStringPtr, JitSymbolFlags>;

pub(crate) type Materializer = Box<dyn FnOnce(MaterializationResponsibility) + Send>;

const ABSOLUTE_UNIT_NAME: &str = "<Absolute Symbols>";

/// A set of symbol definitions that are installed into a dylib as a group.
///
/// Immediate units carry their addresses and are resolved as soon as they are
/// defined. Deferred units only declare names and flags; the first lookup of
/// any of their symbols runs the callback, exactly once, with a
/// [`MaterializationResponsibility`] for all of them.
pub struct MaterializationUnit {
    name: String,
    symbols: SymbolFlagsMap,
    body: UnitBody,
}

pub(crate) enum UnitBody {
    Absolute(SymbolMap),
    Deferred(Materializer),
}

impl MaterializationUnit {
    pub fn absolute(symbols: SymbolMap) -> Self {
        Self {
            name: ABSOLUTE_UNIT_NAME.to_string(),
            symbols: symbols
                .iter()
                .map(|(name, symbol)| (name.clone(), symbol.flags()))
                .collect(),
            body: UnitBody::Absolute(symbols),
        }
    }

    pub fn deferred<F>(name: impl Into<String>, symbols: SymbolFlagsMap, materialize: F) -> Self
    where
        F: FnOnce(MaterializationResponsibility) + Send + 'static,
    {
        Self {
            name: name.into(),
            symbols,
            body: UnitBody::Deferred(Box::new(materialize)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The names this unit defines, with their flags.
    pub fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.body, UnitBody::Deferred(_))
    }

    pub(crate) fn into_parts(self) -> (String, SymbolFlagsMap, UnitBody) {
        (self.name, self.symbols, self.body)
    }
}

impl fmt::Debug for MaterializationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializationUnit")
            .field("name", &self.name)
            .field("symbols", &self.symbols.len())
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

/// Wrap already-known addresses in an immediate unit.
pub fn absolute_symbols(symbols: SymbolMap) -> MaterializationUnit {
    MaterializationUnit::absolute(symbols)
}

// ---------------------------------------------------------------------------
// In-flight rendezvous
// ---------------------------------------------------------------------------

/// Outcome slot shared by every lookup waiting on one materializing symbol.
pub(crate) struct PendingSymbol {
    outcome: Mutex<Option<Result<EvaluatedSymbol, OrcError>>>,
    settled: Condvar,
}

impl PendingSymbol {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            settled: Condvar::new(),
        })
    }

    /// First settlement wins; later ones are ignored.
    pub(crate) fn settle(&self, outcome: Result<EvaluatedSymbol, OrcError>) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.settled.notify_all();
        true
    }

    pub(crate) fn wait(&self) -> Result<EvaluatedSymbol, OrcError> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.settled.wait(&mut slot);
        }
    }
}

/// One symbol's result as reported back by a materializer.
pub(crate) struct Settlement {
    pub(crate) name: SymbolStringPtr,
    pub(crate) pending: Arc<PendingSymbol>,
    pub(crate) outcome: Result<ExecutorAddr, OrcError>,
}

// ---------------------------------------------------------------------------
// Responsibility
// ---------------------------------------------------------------------------

/// The obligation to resolve (or fail) the symbols of a deferred unit.
///
/// Handed to the unit's callback. Results are committed into the target
/// dylib with [`notify_resolved`](Self::notify_resolved); failures with
/// [`fail_materialization`](Self::fail_materialization). Any symbol still
/// unresolved when the responsibility is dropped is failed, so waiters are
/// never left blocked.
pub struct MaterializationResponsibility {
    dylib: JitDylib,
    tracker: ResourceKey,
    unit_name: String,
    symbols: SymbolFlagsMap,
    pending: FxHashMap<SymbolStringPtr, Arc<PendingSymbol>>,
}

impl MaterializationResponsibility {
    pub(crate) fn new(
        dylib: JitDylib,
        tracker: ResourceKey,
        unit_name: String,
        symbols: SymbolFlagsMap,
        pending: FxHashMap<SymbolStringPtr, Arc<PendingSymbol>>,
    ) -> Self {
        Self {
            dylib,
            tracker,
            unit_name,
            symbols,
            pending,
        }
    }

    pub fn target_dylib(&self) -> &JitDylib {
        &self.dylib
    }

    /// Symbols this responsibility still has to resolve.
    pub fn symbols(&self) -> &SymbolFlagsMap {
        &self.symbols
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn tracker(&self) -> ResourceKey {
        self.tracker
    }

    /// Commit addresses for some or all outstanding symbols and wake their
    /// waiters.
    ///
    /// Fails without committing anything if `resolved` names a symbol this
    /// responsibility does not own. If the owning tracker was removed (or the
    /// session ended) while materializing, the results are discarded and the
    /// corresponding error is returned.
    pub fn notify_resolved(&mut self, resolved: SymbolMap) -> Result<(), OrcError> {
        if let Some(stray) = resolved.keys().find(|name| !self.symbols.contains_key(*name)) {
            return Err(OrcError::materialization(
                stray.as_str(),
                Arc::from(format!(
                    "symbol is not owned by materialization unit \"{}\"",
                    self.unit_name
                )),
            ));
        }
        let settlements = resolved
            .into_iter()
            .filter_map(|(name, symbol)| {
                self.symbols.remove(&name);
                let pending = self.pending.remove(&name)?;
                Some(Settlement {
                    name,
                    pending,
                    outcome: Ok(symbol.address()),
                })
            })
            .collect();
        self.dylib.commit(self.tracker, settlements)
    }

    /// Fail every outstanding symbol with the same message.
    pub fn fail_materialization(mut self, message: impl AsRef<str>) {
        self.fail_remaining(Arc::from(message.as_ref()));
    }

    fn fail_remaining(&mut self, message: Arc<str>) {
        if self.pending.is_empty() {
            return;
        }
        self.symbols.clear();
        let settlements = self
            .pending
            .drain()
            .map(|(name, pending)| Settlement {
                outcome: Err(OrcError::materialization(name.as_str(), message.clone())),
                name,
                pending,
            })
            .collect();
        if let Err(err) = self.dylib.commit(self.tracker, settlements) {
            tracing::debug!(unit = %self.unit_name, "discarded materialization failure: {err}");
        }
    }
}

impl Drop for MaterializationResponsibility {
    fn drop(&mut self) {
        self.fail_remaining(Arc::from(
            "materialization responsibility dropped before all symbols were resolved",
        ));
    }
}

impl fmt::Debug for MaterializationResponsibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializationResponsibility")
            .field("dylib", &self.dylib.name())
            .field("tracker", &self.tracker)
            .field("unit", &self.unit_name)
            .field("outstanding", &self.pending.len())
            .finish()
    }
}

/// A detached deferred unit paired with its responsibility, ready to run.
pub(crate) struct MaterializationTask {
    materialize: Materializer,
    responsibility: MaterializationResponsibility,
}

impl MaterializationTask {
    pub(crate) fn new(
        materialize: Materializer,
        responsibility: MaterializationResponsibility,
    ) -> Self {
        Self {
            materialize,
            responsibility,
        }
    }

    pub(crate) fn unit_name(&self) -> &str {
        self.responsibility.unit_name()
    }

    pub(crate) fn run(self) {
        tracing::trace!(
            dylib = self.responsibility.dylib.name(),
            unit = self.responsibility.unit_name(),
            "running materializer"
        );
        (self.materialize)(self.responsibility);
    }
}
