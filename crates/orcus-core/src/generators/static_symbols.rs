use std::fmt;

use orcus_base::{EvaluatedSymbol, ExecutorAddr, JitSymbolFlags, SymbolStringPtr};
use rustc_hash::FxHashMap;

use crate::dylib::JitDylib;
use crate::error::OrcError;
use crate::lookup::{JitDylibLookupFlags, LookupKind};
use crate::materialization::{SymbolMap, absolute_symbols};

use super::DefinitionGenerator;

type AllowFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Serves symbols from a fixed name-to-address table, the way a process
/// symbol table would.
///
/// Matching names are defined as absolute symbols under the dylib's default
/// resource tracker.
pub struct StaticSymbolGenerator {
    table: FxHashMap<String, EvaluatedSymbol>,
    allow: Option<AllowFn>,
    static_only: bool,
}

impl StaticSymbolGenerator {
    pub fn new() -> Self {
        Self {
            table: FxHashMap::default(),
            allow: None,
            static_only: false,
        }
    }

    /// Add (or replace) one entry.
    pub fn with_symbol(
        mut self,
        name: impl Into<String>,
        address: impl Into<ExecutorAddr>,
        flags: JitSymbolFlags,
    ) -> Self {
        self.table
            .insert(name.into(), EvaluatedSymbol::new(address.into(), flags));
        self
    }

    /// Only serve names for which `allow` returns true.
    pub fn with_filter<F>(mut self, allow: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.allow = Some(Box::new(allow));
        self
    }

    /// Ignore `DlSym` lookups.
    pub fn static_lookups_only(mut self) -> Self {
        self.static_only = true;
        self
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn serves(&self, name: &str) -> Option<EvaluatedSymbol> {
        if self.allow.as_ref().is_some_and(|allow| !allow(name)) {
            return None;
        }
        self.table.get(name).copied()
    }
}

impl Default for StaticSymbolGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Into<String>> FromIterator<(S, EvaluatedSymbol)> for StaticSymbolGenerator {
    fn from_iter<I: IntoIterator<Item = (S, EvaluatedSymbol)>>(iter: I) -> Self {
        Self {
            table: iter.into_iter().map(|(name, symbol)| (name.into(), symbol)).collect(),
            allow: None,
            static_only: false,
        }
    }
}

impl DefinitionGenerator for StaticSymbolGenerator {
    fn generate(
        &self,
        kind: LookupKind,
        dylib: &JitDylib,
        _flags: JitDylibLookupFlags,
        names: &[SymbolStringPtr],
    ) -> Result<(), OrcError> {
        if self.static_only && kind == LookupKind::DlSym {
            return Ok(());
        }
        let found: SymbolMap = names
            .iter()
            .filter_map(|name| Some((name.clone(), self.serves(name.as_str())?)))
            .collect();
        if found.is_empty() {
            return Ok(());
        }
        dylib.define(&dylib.default_resource_tracker(), absolute_symbols(found))
    }
}

impl fmt::Debug for StaticSymbolGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSymbolGenerator")
            .field("symbols", &self.table.len())
            .field("filtered", &self.allow.is_some())
            .field("static_only", &self.static_only)
            .finish()
    }
}
