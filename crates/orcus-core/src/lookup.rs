//! The lookup protocol: table probe, materialization rendezvous and
//! generator fallback.

use std::sync::Arc;

use orcus_base::{EvaluatedSymbol, ExecutorAddr, SymbolStringPtr};

use crate::dylib::{GenerationClaim, JitDylib, Probe};
use crate::error::{ErrorKind, OrcError};
use crate::materialization::PendingSymbol;
use crate::session::ExecutionSession;

/// The kind of lookup being performed, as reported to generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LookupKind {
    /// As if resolved by the static linker.
    #[default]
    Static,
    /// As if resolved by `dlsym` at run time.
    DlSym,
}

/// Which records of a dylib a lookup may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JitDylibLookupFlags {
    MatchExportedSymbolsOnly,
    #[default]
    MatchAllSymbols,
}

/// A search order entry: a dylib and how its records are matched.
pub type SearchOrder = [(JitDylib, JitDylibLookupFlags)];

impl ExecutionSession {
    /// Resolve `name` in `dylib`, materializing or generating it if needed.
    pub fn lookup(&self, dylib: &JitDylib, name: &str) -> Result<ExecutorAddr, OrcError> {
        let order = [(dylib.clone(), JitDylibLookupFlags::MatchAllSymbols)];
        self.lookup_symbol(&order, LookupKind::Static, name)
            .map(|symbol| symbol.address())
    }

    /// Resolve `name` against each dylib of `search_order` in turn. The first
    /// dylib that resolves it wins; any error other than `SymbolNotFound`
    /// stops the search.
    pub fn lookup_symbol(
        &self,
        search_order: &SearchOrder,
        kind: LookupKind,
        name: &str,
    ) -> Result<EvaluatedSymbol, OrcError> {
        if !self.is_open() {
            return Err(OrcError::SessionEnded);
        }
        let name = self.intern(name);
        tracing::trace!(symbol = name.as_str(), dylibs = search_order.len(), "lookup");
        for (dylib, flags) in search_order {
            match self.resolve_in(dylib, &name, kind, *flags) {
                Ok(Some(symbol)) => return Ok(symbol),
                Ok(None) => continue,
                Err(err) if err.kind() == ErrorKind::SymbolNotFound => continue,
                Err(err) => return Err(err),
            }
        }
        Err(OrcError::symbol_not_found(name.as_str()))
    }

    /// Resolve several names in `dylib`, in order, stopping at the first
    /// failure.
    pub fn lookup_all(
        &self,
        dylib: &JitDylib,
        names: &[&str],
    ) -> Result<Vec<ExecutorAddr>, OrcError> {
        names.iter().map(|name| self.lookup(dylib, name)).collect()
    }

    fn resolve_in(
        &self,
        dylib: &JitDylib,
        name: &SymbolStringPtr,
        kind: LookupKind,
        flags: JitDylibLookupFlags,
    ) -> Result<Option<EvaluatedSymbol>, OrcError> {
        let mut generated = false;
        loop {
            match dylib.probe(name, flags)? {
                Probe::Ready(symbol) => return Ok(Some(symbol)),
                Probe::Wait(pending) => return await_pending(dylib, name, &pending).map(Some),
                Probe::Materialize { task, pending } => {
                    self.dispatch(task);
                    return await_pending(dylib, name, &pending).map(Some);
                }
                // Generators only serve names with no record at all.
                Probe::Hidden => return Ok(None),
                Probe::Missing if generated => return Ok(None),
                Probe::Missing => {
                    run_generators(dylib, name, kind, flags)?;
                    generated = true;
                }
            }
        }
    }
}

/// Block until the materialization of `name` settles, then check the record
/// still holds the delivered address.
fn await_pending(
    dylib: &JitDylib,
    name: &SymbolStringPtr,
    pending: &Arc<PendingSymbol>,
) -> Result<EvaluatedSymbol, OrcError> {
    let symbol = pending.wait()?;
    if dylib.confirm_resolved(name, symbol.address())? {
        Ok(symbol)
    } else {
        Err(OrcError::symbol_not_found(name.as_str()))
    }
}

/// Consult the generators of `dylib` in order until one of them defines
/// `name`.
///
/// Only one thread at a time runs the generators for a given name; others
/// missing the same name wait for that run and then probe again. No lock is
/// held while a generator runs.
fn run_generators(
    dylib: &JitDylib,
    name: &SymbolStringPtr,
    kind: LookupKind,
    flags: JitDylibLookupFlags,
) -> Result<(), OrcError> {
    let _turn = match dylib.claim_generation(name) {
        GenerationClaim::Claimed(turn) => turn,
        GenerationClaim::InFlight(run) => {
            run.wait();
            return Ok(());
        }
        GenerationClaim::Nested => return Ok(()),
    };
    // Another run may have defined it between our probe and the claim.
    if dylib.contains(name) {
        return Ok(());
    }
    let missing = std::slice::from_ref(name);
    for (index, generator) in dylib.generators().iter().enumerate() {
        tracing::trace!(
            dylib = dylib.name(),
            symbol = name.as_str(),
            generator = index,
            "consulting definition generator"
        );
        generator.generate(kind, dylib, flags, missing)?;
        if dylib.contains(name) {
            break;
        }
    }
    Ok(())
}
