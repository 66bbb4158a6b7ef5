//! Process-wide defaults for the recursion guard.
//!
//! The guard itself is configured per thread through RAII scopes (see [`crate::assertions`]);
//! [`RecursionConfig`] only provides the defaults those scopes start from. Test binaries can
//! enable missed-cache assertions through the environment:
//!
//! ```bash
//! NOVA_RECURSION_ASSERT_MISSED_CACHE=1 cargo test -p nova-recursion
//! ```

use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable enabling missed-cache assertions by default.
pub const ASSERT_MISSED_CACHE_ENV_VAR: &str = "NOVA_RECURSION_ASSERT_MISSED_CACHE";
/// Environment variable enabling prevention assertions by default.
pub const ASSERT_PREVENTION_ENV_VAR: &str = "NOVA_RECURSION_ASSERT_PREVENTION";
/// Environment variable toggling backtrace capture for recorded preventions.
pub const CAPTURE_BACKTRACES_ENV_VAR: &str = "NOVA_RECURSION_CAPTURE_BACKTRACES";
/// Environment variable overriding [`RecursionConfig::max_memoized_per_key`].
pub const MAX_MEMOIZED_PER_KEY_ENV_VAR: &str = "NOVA_RECURSION_MAX_MEMOIZED_PER_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecursionConfig {
    /// Panic with [`crate::CachingPrevented`] when a stamp reports that caching is not allowed.
    #[serde(default)]
    pub assert_on_missed_cache: bool,

    /// Panic with [`crate::StackOverflowPrevented`] whenever a recursive call is prevented.
    #[serde(default)]
    pub assert_on_recursion_prevention: bool,

    /// Capture a backtrace for every prevention made while an assertion mode is active.
    #[serde(default = "RecursionConfig::default_capture_backtraces")]
    pub capture_backtraces: bool,

    /// Upper bound on memoized values sharing one key hash on a thread. Oldest entries are evicted
    /// first.
    #[serde(default = "RecursionConfig::default_max_memoized_per_key")]
    pub max_memoized_per_key: usize,
}

impl RecursionConfig {
    fn default_capture_backtraces() -> bool {
        true
    }

    fn default_max_memoized_per_key() -> usize {
        8
    }

    /// Parse a TOML document such as:
    ///
    /// ```toml
    /// assert_on_missed_cache = true
    /// max_memoized_per_key = 4
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `NOVA_RECURSION_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|var| std::env::var(var).ok())
    }

    /// Like [`RecursionConfig::from_env`], reading variables through `lookup`.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ASSERT_MISSED_CACHE_ENV_VAR) {
            config.assert_on_missed_cache = parse_bool(ASSERT_MISSED_CACHE_ENV_VAR, &value)?;
        }
        if let Some(value) = lookup(ASSERT_PREVENTION_ENV_VAR) {
            config.assert_on_recursion_prevention = parse_bool(ASSERT_PREVENTION_ENV_VAR, &value)?;
        }
        if let Some(value) = lookup(CAPTURE_BACKTRACES_ENV_VAR) {
            config.capture_backtraces = parse_bool(CAPTURE_BACKTRACES_ENV_VAR, &value)?;
        }
        if let Some(value) = lookup(MAX_MEMOIZED_PER_KEY_ENV_VAR) {
            config.max_memoized_per_key =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvValue {
                        var: MAX_MEMOIZED_PER_KEY_ENV_VAR,
                        value: value.clone(),
                    })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memoized_per_key < 1 {
            return Err(ConfigError::OutOfRange {
                field: "max_memoized_per_key",
                min: 1,
                found: self.max_memoized_per_key,
            });
        }
        Ok(())
    }

    /// Make `self` the process default, returning the previous default.
    pub fn install(self) -> RecursionConfig {
        tracing::debug!(
            target: "nova.recursion",
            assert_on_missed_cache = self.assert_on_missed_cache,
            assert_on_recursion_prevention = self.assert_on_recursion_prevention,
            max_memoized_per_key = self.max_memoized_per_key,
            "installing recursion guard config"
        );
        std::mem::replace(&mut *installed().write(), self)
    }

    /// The current process default.
    ///
    /// Until [`RecursionConfig::install`] is called this is [`RecursionConfig::from_env`], falling
    /// back to [`RecursionConfig::default`] when the environment is invalid.
    pub fn current() -> RecursionConfig {
        installed().read().clone()
    }
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self {
            assert_on_missed_cache: false,
            assert_on_recursion_prevention: false,
            capture_backtraces: Self::default_capture_backtraces(),
            max_memoized_per_key: Self::default_max_memoized_per_key(),
        }
    }
}

fn installed() -> &'static RwLock<RecursionConfig> {
    static INSTALLED: OnceLock<RwLock<RecursionConfig>> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let config = RecursionConfig::from_env().unwrap_or_else(|err| {
            tracing::warn!(
                target: "nova.recursion",
                error = %err,
                "ignoring invalid recursion guard environment; using defaults"
            );
            RecursionConfig::default()
        });
        RwLock::new(config)
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnvValue {
            var,
            value: value.to_owned(),
        }),
    }
}
