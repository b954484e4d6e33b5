use thiserror::Error;

/// Unified error type for the Rondo engine
#[derive(Error, Debug)]
pub enum EngineError {
    // Minting errors
    #[error("Credential mint failed: {0}")]
    MintFailed(String),

    #[error("Upstream rejected credential issuance: status {status}")]
    MintRejected { status: u16 },

    // Capacity errors
    #[error("No credentials available")]
    PoolEmpty,

    #[error("No healthy egress path available")]
    NoHealthyPath,

    #[error("Egress path {path_id} is over its request pacing limit")]
    PathRateLimited { path_id: u32 },

    // Lease errors
    #[error("Lease was already completed")]
    DoubleCompletion,

    #[error("Lease not completed within grace period")]
    LeaseExpired,

    // Transport errors
    #[error("Egress connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unsupported egress protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid egress path address: {0}")]
    InvalidPathAddress(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Operation timed out")]
    Timeout,

    #[error("Engine is shutting down")]
    ShuttingDown,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Transient errors are safe to retry internally (with backoff).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::MintFailed(_)
                | EngineError::MintRejected { .. }
                | EngineError::ConnectionFailed(_)
                | EngineError::Timeout
                | EngineError::Http(_)
                | EngineError::Io(_)
        )
    }

    /// Capacity errors mean the engine has nothing to hand out right now;
    /// they are surfaced to the caller instead of retried internally.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            EngineError::PoolEmpty
                | EngineError::NoHealthyPath
                | EngineError::PathRateLimited { .. }
        )
    }

    /// Whether this error indicates upstream rate limiting.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            EngineError::MintRejected { status: 429 } | EngineError::PathRateLimited { .. }
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for EngineError {
    fn from(err: hyper::Error) -> Self {
        EngineError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        EngineError::InvalidPathAddress(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::MintFailed("boom".to_string()).is_transient());
        assert!(EngineError::Timeout.is_transient());
        assert!(EngineError::ConnectionFailed("refused".to_string()).is_transient());

        assert!(!EngineError::PoolEmpty.is_transient());
        assert!(!EngineError::DoubleCompletion.is_transient());
        assert!(!EngineError::InvalidConfig("bad".to_string()).is_transient());
    }

    #[test]
    fn test_capacity_classification() {
        assert!(EngineError::PoolEmpty.is_capacity());
        assert!(EngineError::NoHealthyPath.is_capacity());
        assert!(EngineError::PathRateLimited { path_id: 1 }.is_capacity());

        assert!(!EngineError::Timeout.is_capacity());
        assert!(!EngineError::LeaseExpired.is_capacity());
    }

    #[test]
    fn test_rate_limited_detection() {
        assert!(EngineError::MintRejected { status: 429 }.is_rate_limited());
        assert!(!EngineError::MintRejected { status: 403 }.is_rate_limited());
    }
}
