/// Errors that can occur during child process operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    /// The command line resolved to nothing runnable
    #[error("empty command line")]
    EmptyCommand,
    /// Failed to spawn the child
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    /// Failed to write to the child's stdin
    #[error("failed to write to process: {0}")]
    WriteFailed(String),
    /// Failed to deliver a signal
    #[error("failed to signal process: {0}")]
    SignalFailed(String),
    /// The child has exited and its actor is gone
    #[error("process has exited")]
    ProcessExited,
}

impl ProcessError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyCommand => "empty_command",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::SignalFailed(_) => "signal_failed",
            Self::ProcessExited => "process_exited",
        }
    }
}
