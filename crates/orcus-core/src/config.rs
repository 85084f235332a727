//! Session configuration.
//!
//! A [`SessionConfig`] can be built from defaults, parsed from TOML, or read
//! from `ORCUS_*` environment variables.

use serde::{Deserialize, Serialize};

pub const ENV_MAIN_DYLIB: &str = "ORCUS_MAIN_DYLIB";
pub const ENV_DISPATCH: &str = "ORCUS_DISPATCH";

const DEFAULT_MAIN_DYLIB: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Where materializer callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// On the thread whose lookup triggered materialization.
    #[default]
    InPlace,
    /// On a fresh thread; the triggering lookup blocks until it settles.
    Threaded,
}

impl DispatchMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "in-place" => Some(DispatchMode::InPlace),
            "threaded" => Some(DispatchMode::Threaded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    /// Name of the dylib the [`Jit`](crate::Jit) facade creates up front.
    pub main_dylib: String,
    pub dispatch: DispatchMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            main_dylib: DEFAULT_MAIN_DYLIB.to_string(),
            dispatch: DispatchMode::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults overridden by `ORCUS_MAIN_DYLIB` / `ORCUS_DISPATCH`.
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Err(err) = config.apply_overrides(|key| std::env::var(key).ok()) {
            tracing::warn!("ignoring environment override: {err}");
        }
        config
    }

    /// Apply overrides from an arbitrary key lookup, stopping at the first
    /// invalid value. Earlier valid overrides stay applied.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(name) = lookup(ENV_MAIN_DYLIB) {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: ENV_MAIN_DYLIB,
                    value: name.to_string(),
                });
            }
            self.main_dylib = name.to_string();
        }
        if let Some(value) = lookup(ENV_DISPATCH) {
            self.dispatch = DispatchMode::parse(&value).ok_or(ConfigError::InvalidValue {
                key: ENV_DISPATCH,
                value,
            })?;
        }
        Ok(())
    }
}
