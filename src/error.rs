use thiserror::Error;

/// Top-level error surfaced to `main`. Only fatal startup failures reach
/// this type; everything inside a running bridge funnels through
/// `supervisor::SupervisorError` instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Process exit code: 0 clean, 1 fatal init error, 2 bad configuration.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Fatal(_) => 1,
        }
    }
}
