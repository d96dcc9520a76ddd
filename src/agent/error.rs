/// Failures the agent's state machine distinguishes between.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Token missing, expired or rejected. Re-authenticate.
    #[error("server rejected our token")]
    Unauthenticated,

    /// Wrong hardware id or secret. Needs a human.
    #[error("invalid device credentials")]
    InvalidCredentials,

    /// Operator decommissioned this device. Needs a human.
    #[error("device has been decommissioned")]
    DeviceDecommissioned,

    /// Network trouble, timeouts, 5xx. Retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityFailure { expected: String, actual: String },

    #[error("cache quota exceeded: need {needed} bytes, {available} available")]
    CacheFull { needed: u64, available: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with something we can't use.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Errors that park the agent in `Faulted` until someone intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidCredentials | AgentError::DeviceDecommissioned
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_) | AgentError::Io(_))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AgentError::Protocol(e.to_string())
        } else {
            AgentError::Transient(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(AgentError::InvalidCredentials.is_fatal());
        assert!(AgentError::DeviceDecommissioned.is_fatal());
        assert!(!AgentError::Unauthenticated.is_fatal());
        assert!(AgentError::Transient("timeout".into()).is_transient());
        assert!(!AgentError::Protocol("bad json".into()).is_transient());
    }
}
