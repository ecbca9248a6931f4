//! Error taxonomy for the cluster shell.
//!
//! Every remote or provider failure surfaces immediately as one of these
//! variants. Nothing in this crate retries.

use thiserror::Error;


/// Main error type for cluster provisioning and fleet operations.
#[derive(Error, Debug)]
pub enum ClusterError {
    // Credential bootstrap
    #[error("ssh-agent bootstrap failed: {0}")]
    AgentStart(String),

    // Address discovery
    #[error("cluster resolution failed: {0}")]
    Resolution(String),

    // Remote execution
    #[error("command failed on {host} (exit code {exit_code}): {command}")]
    RemoteExecution {
        host: String,
        command: String,
        exit_code: i32,
    },

    #[error("refusing to remove '{0}': path looks too dangerous for rm -r")]
    UnsafePath(String),

    #[error("transfer {source_path} -> {destination} failed: {detail}")]
    Transfer {
        source_path: String,
        destination: String,
        detail: String,
    },

    // Provider collaborators
    #[error("provider call '{operation}' failed: {detail}")]
    Provider { operation: String, detail: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ClusterError
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// Exit code of the failed remote process, if this is a remote failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ClusterError::RemoteExecution { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}
