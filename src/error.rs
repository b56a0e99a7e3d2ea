//! Error types for sandbox-session

use thiserror::Error;

/// Result type alias using sandbox-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sandbox-session operations
#[derive(Error, Debug)]
pub enum Error {
    /// A managed component was asked to start while running
    #[error("{0} is already running")]
    AlreadyRunning(String),

    /// A managed component is not running
    #[error("{0} is not running")]
    NotRunning(String),

    /// Required executable missing from PATH
    #[error("{binary} not found in PATH ({hint})")]
    BinaryNotFound { binary: String, hint: String },

    /// A launched process died during its startup probe
    #[error("{component} exited during startup: {status}")]
    ExitedEarly { component: String, status: String },

    /// Session registration refused
    #[error("maximum concurrent sessions ({max}) reached")]
    CapacityExceeded { max: usize },

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    TimedOut(String),

    /// Malformed or forged token
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token was well-formed but its lifetime has passed
    #[error("token expired")]
    TokenExpired,

    /// Token was explicitly revoked
    #[error("token revoked")]
    TokenRevoked,

    /// Privileged command refused by policy
    #[error("command denied: {command} ({reason})")]
    CommandDenied { command: String, reason: String },

    /// Command or binary could not be located
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// Unknown seccomp profile name
    #[error("seccomp profile '{0}' not found")]
    ProfileNotFound(String),

    /// Seccomp compilation / installation errors
    #[error("Seccomp error: {0}")]
    Seccomp(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Subprocess control errors
    #[error("Process error: {0}")]
    Process(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML configuration parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Soft errors are reported but count as success on stop paths.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::NotRunning(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_running_is_soft() {
        assert!(Error::NotRunning("desktop".into()).is_soft());
        assert!(!Error::AlreadyRunning("desktop".into()).is_soft());
        assert!(!Error::TokenExpired.is_soft());
    }

    #[test]
    fn test_binary_not_found_carries_hint() {
        let err = Error::BinaryNotFound {
            binary: "ttyd".into(),
            hint: "apt-get install -y ttyd".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ttyd"));
        assert!(msg.contains("apt-get install -y ttyd"));
    }
}
