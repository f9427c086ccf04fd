/// Storage error with retry classification
///
/// Backends return this error type to say whether an operation may be retried
/// and whether it lost an optimistic concurrency race.
///
/// # Error Classification
///
/// **Retryable**:
/// - Database busy/locked
/// - Connection timeouts
/// - Transient I/O failures
///
/// **Permanent**:
/// - Corrupt or undecodable records
/// - Invalid input
/// - Configuration errors
///
/// **ConcurrencyConflict**:
/// - The etag presented with a state write does not match the stored one
///
/// # Example Usage
///
/// ```rust,no_run
/// use routine_fabric::providers::StorageError;
///
/// # fn example() -> Result<(), StorageError> {
/// return Err(StorageError::retryable("write_state", "Database is busy"));
/// # }
/// # fn example2() -> Result<(), StorageError> {
/// return Err(StorageError::conflict("write_state", "etag mismatch"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    /// Operation that failed (e.g., "write_state", "read_state")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: StorageErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Retryable,
    Permanent,
    ConcurrencyConflict,
}

impl StorageError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: StorageErrorKind::Retryable,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: StorageErrorKind::Permanent,
        }
    }

    /// The presented etag is stale.
    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: StorageErrorKind::ConcurrencyConflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == StorageErrorKind::Retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == StorageErrorKind::ConcurrencyConflict
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::PermissionDenied => {
                StorageError::permanent("io", e.to_string())
            }
            _ => StorageError::retryable("io", e.to_string()),
        }
    }
}
