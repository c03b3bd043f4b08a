use std::io;
use thiserror::Error;

/// Failures of the tunnel control utility or the persisted interface definition.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The control utility ran and reported failure. Usually the interface
    /// is not ready yet, so callers treat this as transient.
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// The control utility could not be started at all
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The control utility did not finish in time
    #[error("`{command}` timed out")]
    Timeout { command: String },

    /// The interface definition file could not be parsed
    #[error("interface definition is corrupt at line {line}: {message}")]
    ConfigCorruption { line: usize, message: String },

    /// Output of the control utility did not have the expected shape
    #[error("unexpected output from `{command}`: {message}")]
    UnexpectedOutput { command: String, message: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::Command { .. } | TunnelError::Timeout { .. } | TunnelError::Io(_)
        )
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
