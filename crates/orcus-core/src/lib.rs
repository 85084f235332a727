//! JIT symbol resolution and dylib lifecycle.
//!
//! An [`ExecutionSession`] interns symbol names and owns a registry of
//! [`JitDylib`]s. Definitions enter a dylib as [`MaterializationUnit`]s under
//! a [`ResourceTracker`]; lookups resolve them, running deferred
//! materializers exactly once and consulting [`DefinitionGenerator`]s on a
//! miss. Removing a tracker revokes everything it owns, atomically.

#![deny(clippy::unwrap_used)]

mod config;
mod dylib;
mod error;
mod generators;
mod jit;
mod lookup;
mod materialization;
mod resource_tracker;
mod session;

pub use config::{ConfigError, DispatchMode, ENV_DISPATCH, ENV_MAIN_DYLIB, SessionConfig};
pub use dylib::{JitDylib, SymbolState};
pub use error::{ErrorKind, OrcError};
pub use generators::{DefinitionGenerator, FnGenerator, ReexportsGenerator, StaticSymbolGenerator};
pub use jit::Jit;
pub use lookup::{JitDylibLookupFlags, LookupKind, SearchOrder};
pub use materialization::{
    MaterializationResponsibility, MaterializationUnit, SymbolFlagsMap, SymbolMap,
    absolute_symbols,
};
pub use orcus_base::{
    EvaluatedSymbol, ExecutorAddr, JitSymbolFlags, SymbolStringPool, SymbolStringPtr,
};
pub use resource_tracker::{ResourceKey, ResourceTracker};
pub use session::ExecutionSession;
