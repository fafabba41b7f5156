//! Error types for the Keel runtime
//!
//! All fallible operations return `Result<T, Error>`. Every variant maps to a
//! stable numeric [`Status`] so failures can cross the C boundary as plain
//! values.

/// Keel runtime error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `init` was called again with a configuration that differs from the active one
    #[error("runtime already initialized with a different configuration")]
    AlreadyInitialized,

    /// An operation was issued before `init`
    #[error("runtime not initialized")]
    NotInitialized,

    /// Configuration text could not be parsed or holds out-of-range values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Module bytes are malformed or use constructs the sandbox refuses
    #[error("invalid module: {0}")]
    InvalidModule(String),

    /// A configured ceiling was hit (module size)
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No module is registered under the identity (hex encoded)
    #[error("unknown contract {0}")]
    UnknownContract(String),

    /// The module exports no entry point with this name
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Fuel ran out or memory growth passed the ceiling
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The module trapped (unreachable, out-of-bounds access, abort, host misuse)
    #[error("execution trapped: {0}")]
    ExecutionTrapped(String),

    /// A request failed boundary validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A buffer was released a second time
    #[error("buffer {0} was already released")]
    DoubleRelease(String),

    /// A buffer the runtime never issued was released
    #[error("buffer {0} was not issued by this runtime")]
    ForeignRelease(String),

    /// The durable medium failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Numeric status for this error
    pub fn status(&self) -> Status {
        match self {
            Error::AlreadyInitialized => Status::AlreadyInitialized,
            Error::NotInitialized => Status::NotInitialized,
            Error::InvalidConfig(_) => Status::InvalidConfig,
            Error::InvalidModule(_) => Status::InvalidModule,
            Error::ResourceExhausted(_) => Status::ResourceExhausted,
            Error::UnknownContract(_) => Status::UnknownContract,
            Error::UnknownFunction(_) => Status::UnknownFunction,
            Error::BudgetExceeded(_) => Status::BudgetExceeded,
            Error::ExecutionTrapped(_) => Status::ExecutionTrapped,
            Error::InvalidArgument(_) => Status::InvalidArgument,
            Error::DoubleRelease(_) => Status::DoubleRelease,
            Error::ForeignRelease(_) => Status::ForeignRelease,
            Error::Storage(_) => Status::Storage,
        }
    }

    /// True for failures raised by contract execution itself rather than by
    /// the caller or the host environment
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Error::UnknownContract(_)
                | Error::UnknownFunction(_)
                | Error::BudgetExceeded(_)
                | Error::ExecutionTrapped(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Status codes shared with the C ABI. `Ok` is zero; values never change.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    AlreadyInitialized = 1,
    NotInitialized = 2,
    InvalidConfig = 3,
    InvalidModule = 4,
    ResourceExhausted = 5,
    UnknownContract = 6,
    UnknownFunction = 7,
    BudgetExceeded = 8,
    ExecutionTrapped = 9,
    InvalidArgument = 10,
    DoubleRelease = 11,
    ForeignRelease = 12,
    Storage = 13,
    /// A panic was caught at the C boundary
    Internal = 99,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Result type alias for Keel operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Error::AlreadyInitialized.status().code(), 1);
        assert_eq!(Error::UnknownFunction("f".into()).status().code(), 7);
        assert_eq!(Error::BudgetExceeded("fuel".into()).status().code(), 8);
        assert_eq!(Error::DoubleRelease("#1".into()).status().code(), 11);
        assert_eq!(Error::Storage("disk".into()).status().code(), 13);
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::UnknownFunction("increment".into());
        assert_eq!(err.to_string(), "unknown function 'increment'");
        let err = Error::InvalidModule("bad magic".into());
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_execution_failure_classification() {
        assert!(Error::ExecutionTrapped("x".into()).is_execution_failure());
        assert!(Error::BudgetExceeded("x".into()).is_execution_failure());
        assert!(!Error::InvalidArgument("x".into()).is_execution_failure());
        assert!(!Error::Storage("x".into()).is_execution_failure());
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: Error = io.into();
        assert_eq!(err.status(), Status::Storage);
    }
}
