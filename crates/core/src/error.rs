use thiserror::Error;

/// Programming errors raised by the engine's caches and registry.
///
/// Absence is never an error: lookups return `Option`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A key was used with a different value kind than the one it was first stored with.
    #[error("type mismatch on `{key}`: expected {expected}, found {found}")]
    TypeMismatch { key: String, expected: &'static str, found: &'static str },
    #[error("control function `{0}` registered twice")]
    DuplicateUnit(&'static str),
}

impl EngineError {
    pub fn mismatch(key: &str, expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch { key: key.to_string(), expected, found }
    }
}
