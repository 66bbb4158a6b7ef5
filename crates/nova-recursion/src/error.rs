/// A recursive computation that the guard refused to run.
///
/// Describes the cause of a [`CachingPrevented`], and is raised as a panic payload when prevention
/// assertions are active. `trace` is only captured while an assertion mode is active.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("recursion prevented for {key}")]
pub struct StackOverflowPrevented {
    /// `guard: key` of the prevented computation.
    pub key: String,
    /// Keys on the calculation stack at the time of prevention, bottom first.
    pub stack: Vec<String>,
    /// Rendered backtrace of the prevented call, when capture was enabled.
    pub trace: Option<String>,
}

/// A caller asked to cache a value that was computed while recursion was prevented.
///
/// Only produced while missed-cache assertions are active.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("caching prevented by {} recursion prevention(s){}", .prevented.len(), describe_first(.prevented))]
pub struct CachingPrevented {
    /// `guard: key` of every prevention that still taints the stack.
    pub prevented: Vec<String>,
    /// The oldest prevention that still taints the stack.
    #[source]
    pub cause: Option<StackOverflowPrevented>,
}

fn describe_first(prevented: &[String]) -> String {
    match prevented.first() {
        Some(first) => format!(" (first: {first})"),
        None => String::new(),
    }
}

/// Errors produced while loading a [`crate::RecursionConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse recursion config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnvValue { var: &'static str, value: String },

    #[error("{field} must be at least {min}, found {found}")]
    OutOfRange {
        field: &'static str,
        min: usize,
        found: usize,
    },
}
