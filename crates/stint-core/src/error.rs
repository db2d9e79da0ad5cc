use thiserror::Error;

/// Error taxonomy.
///
/// - `TransientStorage` is the only retriable class; the storage-boundary
///   retry wraps the last cause in `Execution` once attempts are exhausted.
/// - Acquisition results (`Granted`/`Denied`) are values, never errors.
#[derive(Debug, Error)]
pub enum StintError {
    /// Missing or invalid task configuration.
    #[error("no configuration for task {0}")]
    Configuration(String),

    /// A required argument is absent or inconsistent (e.g. a death mode
    /// without its threshold).
    #[error("{0}")]
    InvalidArgument(String),

    /// A critical-section operation referenced a task definition or
    /// execution that does not exist.
    #[error("critical section: {0}")]
    CriticalSection(String),

    /// Retriable storage failure: timeout, deadlock, dropped connection.
    #[error("transient storage failure: {0}")]
    TransientStorage(String),

    /// Non-retriable domain failure, including exhausted retries and corrupt
    /// stored encodings.
    #[error("{0}")]
    Execution(String),
}

impl StintError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }

    /// Wrap an exhausted transient failure as a terminal execution error.
    pub fn retries_exhausted(self, attempts: u32) -> Self {
        Self::Execution(format!("retries exhausted after {attempts} attempts: {self}"))
    }
}
