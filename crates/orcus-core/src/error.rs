use std::sync::Arc;

use crate::resource_tracker::ResourceKey;

/// Discriminant of an [`OrcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DuplicateDefinition,
    SymbolNotFound,
    MaterializationFailure,
    AlreadyRemoved,
    DuplicateDylib,
    SessionEnded,
    GeneratorFailure,
    Config,
    ForeignSymbol,
}

/// Every recoverable failure the engine reports.
///
/// Cloneable so that a single materialization outcome can be handed to each
/// waiter on the same symbol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrcError {
    #[error("duplicate definition of `{name}` in JITDylib \"{dylib}\"")]
    DuplicateDefinition { dylib: String, name: String },
    #[error("symbol not found: `{name}`")]
    SymbolNotFound { name: String },
    #[error("failed to materialize `{name}`: {message}")]
    MaterializationFailure { name: String, message: Arc<str> },
    #[error("resource tracker {key} has already been removed")]
    AlreadyRemoved { key: ResourceKey },
    #[error("a JITDylib named \"{name}\" already exists")]
    DuplicateDylib { name: String },
    #[error("execution session has ended")]
    SessionEnded,
    #[error("definition generator failed: {message}")]
    GeneratorFailure { message: Arc<str> },
    #[error("invalid session config: {message}")]
    Config { message: Arc<str> },
    #[error("symbol `{name}` was interned by another session's string pool")]
    ForeignSymbol { name: String },
}

impl OrcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrcError::DuplicateDefinition { .. } => ErrorKind::DuplicateDefinition,
            OrcError::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            OrcError::MaterializationFailure { .. } => ErrorKind::MaterializationFailure,
            OrcError::AlreadyRemoved { .. } => ErrorKind::AlreadyRemoved,
            OrcError::DuplicateDylib { .. } => ErrorKind::DuplicateDylib,
            OrcError::SessionEnded => ErrorKind::SessionEnded,
            OrcError::GeneratorFailure { .. } => ErrorKind::GeneratorFailure,
            OrcError::Config { .. } => ErrorKind::Config,
            OrcError::ForeignSymbol { .. } => ErrorKind::ForeignSymbol,
        }
    }

    pub fn symbol_not_found(name: impl Into<String>) -> Self {
        OrcError::SymbolNotFound { name: name.into() }
    }

    /// Error a generator can return to abort the lookup that invoked it.
    pub fn generator(message: impl AsRef<str>) -> Self {
        OrcError::GeneratorFailure {
            message: Arc::from(message.as_ref()),
        }
    }

    pub(crate) fn materialization(name: impl Into<String>, message: Arc<str>) -> Self {
        OrcError::MaterializationFailure {
            name: name.into(),
            message,
        }
    }
}

impl From<crate::config::ConfigError> for OrcError {
    fn from(err: crate::config::ConfigError) -> Self {
        OrcError::Config {
            message: Arc::from(err.to_string()),
        }
    }
}
