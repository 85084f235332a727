//! Ready-made session with a main dylib.

use orcus_base::{ExecutorAddr, SymbolStringPtr};

use crate::config::SessionConfig;
use crate::dylib::JitDylib;
use crate::error::OrcError;
use crate::materialization::MaterializationUnit;
use crate::resource_tracker::ResourceTracker;
use crate::session::ExecutionSession;

/// An [`ExecutionSession`] with its main dylib already created.
///
/// Definitions added without an explicit tracker go under the main dylib's
/// default tracker. Dropping the `Jit` ends the session.
#[derive(Debug)]
pub struct Jit {
    session: ExecutionSession,
    main: JitDylib,
}

impl Jit {
    pub fn new() -> Result<Self, OrcError> {
        Self::with_config(SessionConfig::default())
    }

    /// Build from `ORCUS_*` environment overrides.
    pub fn from_env() -> Result<Self, OrcError> {
        Self::with_config(SessionConfig::from_env())
    }

    pub fn with_config(config: SessionConfig) -> Result<Self, OrcError> {
        let main_name = config.main_dylib.clone();
        let session = ExecutionSession::with_config(config);
        let main = session.create_jit_dylib(main_name)?;
        Ok(Self { session, main })
    }

    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    pub fn main_dylib(&self) -> &JitDylib {
        &self.main
    }

    pub fn intern(&self, name: &str) -> SymbolStringPtr {
        self.session.intern(name)
    }

    pub fn add_symbols(&self, unit: MaterializationUnit) -> Result<(), OrcError> {
        self.main.define(&self.main.default_resource_tracker(), unit)
    }

    /// Define `unit` into the dylib `tracker` was created for.
    pub fn add_symbols_with_tracker(
        &self,
        tracker: &ResourceTracker,
        unit: MaterializationUnit,
    ) -> Result<(), OrcError> {
        let dylib = tracker.dylib().ok_or(OrcError::SessionEnded)?;
        dylib.define(tracker, unit)
    }

    /// Look `name` up in the main dylib.
    pub fn lookup(&self, name: &str) -> Result<ExecutorAddr, OrcError> {
        self.session.lookup(&self.main, name)
    }

    pub fn lookup_in(&self, dylib: &JitDylib, name: &str) -> Result<ExecutorAddr, OrcError> {
        self.session.lookup(dylib, name)
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        self.session.end_session();
    }
}
