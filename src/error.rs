//! Error types for cache operations.

/// Errors surfaced by the public cache surface.
///
/// Corrupt documents are not an error: they are backed up and replaced with an
/// empty document while loading. Only I/O failures reach the caller from the
/// persistence layer, wrapped in [`CacheError::Io`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key starts with the reserved prefix.
    #[error("key `{0}` is reserved for internal use")]
    ReservedKey(String),

    /// Empty keys cannot be stored.
    #[error("keys must not be empty")]
    EmptyKey,

    /// The stored node cannot be converted to the requested type.
    #[error(
        "type mismatch at `{}`: expected {expected}, found {found}",
        .key.as_deref().unwrap_or("<node>")
    )]
    TypeMismatch {
        key: Option<String>,
        expected: &'static str,
        found: &'static str,
    },

    /// A value was required but nothing is stored under the key.
    #[error("no value stored under `{0}`")]
    MissingValue(String),

    /// NaN and infinities have no representation in the document format.
    #[error("cannot store non-finite float {0}")]
    NonFiniteFloat(f64),

    /// A serde bridge failed to convert a value.
    #[error("value conversion failed: {0}")]
    Conversion(#[from] serde_json::Error),

    /// Reading or writing the backing file failed.
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl CacheError {
    pub(crate) fn mismatch(expected: &'static str, found: &'static str) -> Self {
        CacheError::TypeMismatch {
            key: None,
            expected,
            found,
        }
    }

    /// Attach the key a conversion failed for, unless one is already set.
    pub(crate) fn with_key(self, key: &str) -> Self {
        match self {
            CacheError::TypeMismatch {
                key: None,
                expected,
                found,
            } => CacheError::TypeMismatch {
                key: Some(key.to_string()),
                expected,
                found,
            },
            other => other,
        }
    }
}

/// Result type alias for cache operations.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
