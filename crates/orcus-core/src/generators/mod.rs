//! On-miss definition generators.
//!
//! A dylib consults its generators, in registration order, when a lookup
//! finds no record for a name. Each generator may define some or all of the
//! missing names into the dylib; the search stops at the first generator
//! after which the name has a record.

use orcus_base::SymbolStringPtr;

use crate::dylib::JitDylib;
use crate::error::OrcError;
use crate::lookup::{JitDylibLookupFlags, LookupKind};

mod reexports;
mod static_symbols;

pub use reexports::ReexportsGenerator;
pub use static_symbols::StaticSymbolGenerator;

pub trait DefinitionGenerator: Send + Sync {
    /// Try to define `names` into `dylib`.
    ///
    /// Called with no table lock held, so implementations may define into
    /// `dylib` and look up other symbols. Returning an error aborts the lookup
    /// that triggered the call with that error.
    fn generate(
        &self,
        kind: LookupKind,
        dylib: &JitDylib,
        flags: JitDylibLookupFlags,
        names: &[SymbolStringPtr],
    ) -> Result<(), OrcError>;
}

/// Adapts a closure into a [`DefinitionGenerator`].
pub struct FnGenerator<F> {
    generate: F,
}

impl<F> FnGenerator<F>
where
    F: Fn(LookupKind, &JitDylib, JitDylibLookupFlags, &[SymbolStringPtr]) -> Result<(), OrcError>
        + Send
        + Sync,
{
    pub fn new(generate: F) -> Self {
        Self { generate }
    }
}

impl<F> DefinitionGenerator for FnGenerator<F>
where
    F: Fn(LookupKind, &JitDylib, JitDylibLookupFlags, &[SymbolStringPtr]) -> Result<(), OrcError>
        + Send
        + Sync,
{
    fn generate(
        &self,
        kind: LookupKind,
        dylib: &JitDylib,
        flags: JitDylibLookupFlags,
        names: &[SymbolStringPtr],
    ) -> Result<(), OrcError> {
        (self.generate)(kind, dylib, flags, names)
    }
}
