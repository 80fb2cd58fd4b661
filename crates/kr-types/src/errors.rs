use thiserror::Error;

/// Main error type for the Kromatic system
#[derive(Error, Debug)]
pub enum KrError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {waited_secs:.1}s with {pending} work item(s) still pending")]
    Timeout { waited_secs: f64, pending: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Reference and result data errors
#[derive(Error, Debug)]
pub enum DataError {
    #[error("No {curve} data found for component {component} in {source_name}")]
    MissingCurve {
        source_name: String,
        component: String,
        curve: String,
    },

    #[error("Experiment {experiment} has no output data")]
    NoOutput { experiment: String },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Unreadable artifact {path}: {message}")]
    UnreadableArtifact { path: String, message: String },

    #[error("Product mismatch: expected {expected}, got {actual}")]
    ProductMismatch { expected: String, actual: String },
}

/// Solver and worker-pool errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Solver binary not found: {binary}")]
    SolverNotFound { binary: String },

    #[error("Solver failed with return code {return_code}: {message}")]
    SolverFailed { return_code: i32, message: String },

    #[error("Output mismatch: expected {expected}, solver reported {actual}")]
    OutputMismatch { expected: String, actual: String },

    #[error("Worker pool is {state}, cannot {action}")]
    PoolState { state: String, action: String },
}

/// Failed identity lookups
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Index {index} out of range for {owner} of size {size}")]
    Index {
        owner: String,
        index: usize,
        size: usize,
    },

    #[error("Target experiment not found: {name}")]
    Target { name: String },

    #[error("Value {value} not found among scanned values of {parameter}")]
    ScannedValue { parameter: String, value: f64 },

    #[error("Component not found: {name}")]
    Component { name: String },
}

/// Result type alias for Kromatic operations
pub type KrResult<T> = Result<T, KrError>;

impl From<csv::Error> for KrError {
    fn from(err: csv::Error) -> Self {
        KrError::Csv(err.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::errors::KrError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::KrError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::KrError::Config(format!($($arg)*))
    };
}
