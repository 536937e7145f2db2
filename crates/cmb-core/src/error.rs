/// Error taxonomy shared across the bridge.
///
/// Every failure a tool invocation can surface maps onto one of these kinds;
/// the front door turns them into tool-error responses, never into transport
/// failures.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("Sandbox backend '{0}' is not available")]
    BackendUnavailable(String),

    #[error("Execution timed out after {0}s")]
    Timeout(u64),

    #[error("Execution exceeded the sandbox memory limit")]
    MemoryExhausted,

    #[error("Sandbox crashed: {0}")]
    SandboxCrash(String),

    #[error("Unknown tool '{0}'")]
    ToolNotFound(String),

    #[error("Upstream server '{server}' failed: {message}")]
    Upstream { server: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid cursor")]
    InvalidCursor,

    #[error("Failed to parse config: {0}")]
    ConfigParse(String),

    #[error("Invalid config: {0}")]
    ConfigValidation(String),
}

impl BridgeError {
    /// True when a session's runtime must be rebuilt before the next call.
    pub fn requires_dispose(&self) -> bool {
        matches!(self, Self::SandboxCrash(_) | Self::MemoryExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_backend_unavailable() {
        let err = BridgeError::BackendUnavailable("container".into());
        assert_eq!(err.to_string(), "Sandbox backend 'container' is not available");
    }

    #[test]
    fn test_display_timeout() {
        let err = BridgeError::Timeout(30);
        assert_eq!(err.to_string(), "Execution timed out after 30s");
    }

    #[test]
    fn test_display_upstream() {
        let err = BridgeError::Upstream {
            server: "github".into(),
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Upstream server 'github' failed: connection refused"
        );
    }

    #[test]
    fn test_display_invalid_cursor() {
        assert_eq!(BridgeError::InvalidCursor.to_string(), "Invalid cursor");
    }

    #[test]
    fn test_requires_dispose() {
        assert!(BridgeError::SandboxCrash("boom".into()).requires_dispose());
        assert!(BridgeError::MemoryExhausted.requires_dispose());
        assert!(!BridgeError::Timeout(30).requires_dispose());
        assert!(!BridgeError::ToolNotFound("x".into()).requires_dispose());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeError>();
    }
}
