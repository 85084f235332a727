use std::fmt;

use orcus_base::SymbolStringPtr;
use rustc_hash::FxHashMap;

use crate::dylib::JitDylib;
use crate::error::{ErrorKind, OrcError};
use crate::lookup::{JitDylibLookupFlags, LookupKind};
use crate::materialization::{SymbolMap, absolute_symbols};
use crate::resource_tracker::{ResourceKey, ResourceTracker};

use super::DefinitionGenerator;

type AllowFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Re-exports symbols of another dylib.
///
/// A missing name is looked up in the source dylib (materializing it there
/// if needed) and the resolved address is defined into the requesting dylib
/// under the tracker that owns the source record, so removing that tracker
/// revokes the re-export as well. If no handle to the owning tracker is left,
/// the requesting dylib's default tracker is used.
pub struct ReexportsGenerator {
    source: JitDylib,
    source_flags: JitDylibLookupFlags,
    allow: Option<AllowFn>,
}

impl ReexportsGenerator {
    pub fn new(source: JitDylib, source_flags: JitDylibLookupFlags) -> Self {
        Self {
            source,
            source_flags,
            allow: None,
        }
    }

    /// Only re-export names for which `allow` returns true.
    pub fn with_filter<F>(mut self, allow: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.allow = Some(Box::new(allow));
        self
    }

    pub fn source(&self) -> &JitDylib {
        &self.source
    }
}

impl DefinitionGenerator for ReexportsGenerator {
    fn generate(
        &self,
        kind: LookupKind,
        dylib: &JitDylib,
        _flags: JitDylibLookupFlags,
        names: &[SymbolStringPtr],
    ) -> Result<(), OrcError> {
        if *dylib == self.source {
            return Ok(());
        }
        let session = dylib.session().ok_or(OrcError::SessionEnded)?;
        let order = [(self.source.clone(), self.source_flags)];
        let mut by_owner: FxHashMap<ResourceKey, (ResourceTracker, SymbolMap)> =
            FxHashMap::default();
        for name in names {
            if self.allow.as_ref().is_some_and(|allow| !allow(name.as_str())) {
                continue;
            }
            let symbol = match session.lookup_symbol(&order, kind, name.as_str()) {
                Ok(symbol) => symbol,
                Err(err) if err.kind() == ErrorKind::SymbolNotFound => continue,
                Err(err) => return Err(err),
            };
            // Revoked since the lookup returned.
            let Some(key) = self.source.resolved_owner(name, symbol.address()) else {
                continue;
            };
            let tracker = session
                .resource_tracker(key)
                .unwrap_or_else(|| dylib.default_resource_tracker());
            by_owner
                .entry(tracker.key())
                .or_insert_with(|| (tracker, SymbolMap::default()))
                .1
                .insert(name.clone(), symbol);
        }
        for (tracker, found) in by_owner.into_values() {
            tracing::trace!(
                dylib = dylib.name(),
                source = self.source.name(),
                tracker = %tracker.key(),
                symbols = found.len(),
                "re-exporting symbols"
            );
            match dylib.define(&tracker, absolute_symbols(found)) {
                Ok(()) => {}
                // The owner was removed after we resolved through it.
                Err(OrcError::AlreadyRemoved { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ReexportsGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReexportsGenerator")
            .field("source", &self.source.name())
            .field("source_flags", &self.source_flags)
            .field("filtered", &self.allow.is_some())
            .finish()
    }
}
