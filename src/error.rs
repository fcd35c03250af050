use thiserror::Error;

/// Errors surfaced by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS refused to create the child process.
    #[error("failed to launch process '{name}' ({command}): {source}")]
    Launch {
        name: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The referenced process name was never started.
    #[error("process '{0}' not found")]
    NotFound(String),

    /// The liveness probe could not confirm the process.
    #[error("health check failed for process '{name}': {reason}")]
    HealthCheck { name: String, reason: String },

    /// The supervisor has already been shut down.
    #[error("supervisor is shut down")]
    ShutDown,
}
