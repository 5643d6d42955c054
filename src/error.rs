use thiserror::Error;

/// Main error type for wren.
///
/// Throttling is not an error: rate limiters answer with a `bool`.
/// Variants carry owned strings so the error is `Clone` and can be handed
/// to every waiter of a shared in-flight fetch.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WrenError {
    /// Invalid input to an operation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lookup on a hash ring with no registered nodes
    #[error("Validation error: hash ring is empty")]
    EmptyRing,

    /// Failure reported by a backing store or counter store collaborator
    #[error("Backing store error: {0}")]
    BackingStore(String),

    /// Invalid settings or missing runtime requirements
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background task failed to join or did not stop in time
    #[error("Task error: {0}")]
    Task(String),
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, WrenError>;

impl WrenError {
    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            WrenError::Validation(_) | WrenError::EmptyRing => "validation_error",
            WrenError::BackingStore(_) => "backing_store_error",
            WrenError::Config(_) => "configuration_error",
            WrenError::Task(_) => "task_error",
        }
    }

    /// Errors a caller may reasonably retry
    pub fn is_transient(&self) -> bool {
        matches!(self, WrenError::BackingStore(_))
    }
}

impl From<tokio::task::JoinError> for WrenError {
    fn from(err: tokio::task::JoinError) -> Self {
        WrenError::Task(err.to_string())
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::WrenError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::WrenError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! store_error {
    ($msg:expr) => {
        $crate::error::WrenError::BackingStore($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::WrenError::BackingStore(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::error::WrenError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::WrenError::Validation(format!($fmt, $($arg)*))
    };
}
