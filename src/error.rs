use thiserror::Error;

/// Error kinds shared by every subsystem. The variant decides the recovery
/// policy: transient kinds are retried through the GPU coordinator, content
/// policy goes through the moderation refiner, and only `InvalidArgument`,
/// `ContentPolicyExhausted` and `Fatal` reach the scheduler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    #[error("content policy retries exhausted after {attempts} attempts: {message}")]
    ContentPolicyExhausted { attempts: u32, message: String },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("failed to parse upstream response: {0}")]
    ParseFailure(String),

    #[error("comparison failed: {0}")]
    ComparisonFailure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    pub fn unavailable(msg: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable(msg.to_string())
    }

    pub fn parse(msg: impl std::fmt::Display) -> Self {
        Self::ParseFailure(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    /// Connection-level failures worth one coordinator-driven restart.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Timeout(_))
    }

    pub fn is_content_policy(&self) -> bool {
        matches!(self, Self::ContentPolicy(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::ServiceUnavailable(err.to_string())
        } else if err.is_decode() || err.is_body() {
            Self::ParseFailure(err.to_string())
        } else {
            Self::ServiceUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseFailure(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Fatal(format!("index database: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn transient_classification() {
        assert!(EngineError::unavailable("connection refused").is_transient());
        assert!(EngineError::Timeout("10m".into()).is_transient());
        assert!(!EngineError::invalid("bad alpha").is_transient());
        assert!(!EngineError::Cancelled.is_transient());
    }

    #[test]
    fn json_errors_map_to_parse_failure() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(EngineError::from(err), EngineError::ParseFailure(_)));
    }
}
