//! Error types for the sandbox.

/// Errors that can occur in the sandbox.
///
/// Plugin failures (throws, rejections, timeouts, heap exhaustion) are not
/// errors: they are reported as `exception` verdicts by [`crate::Instance::check`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("No snapshot installed")]
    NoSnapshot,

    #[error("Invalid snapshot")]
    InvalidSnapshot,

    #[error("Failed to load builtin library: {0}")]
    Builtins(String),

    #[error("Runtime instance has terminated")]
    Terminated,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("Invalid check parameters: {0}")]
    InvalidParams(String),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<figment::Error> for SandboxError {
    fn from(err: figment::Error) -> Self {
        SandboxError::Config(err.to_string())
    }
}
