//! Inference error types.
//!
//! Providers map transport and wire failures into these variants; the agent
//! loop decides whether a failure ends the query.

use thiserror::Error;

/// Errors that can occur while talking to an LLM provider.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The provider did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The model emitted tool-call arguments that are not a JSON object.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_arguments: String, reason: String },

    /// The response body did not match the provider's wire format.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// Missing API key, bad base URL and similar.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Map a `reqwest` send/read failure.
    pub(crate) fn from_reqwest(endpoint: &str, timeout_secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display() {
        let err = InferenceError::HttpError {
            status: 529,
            body: "overloaded".into(),
        };
        assert_eq!(err.to_string(), "HTTP 529: overloaded");
        assert_eq!(err.error_body(), Some("overloaded"));
    }

    #[test]
    fn test_error_body_none_for_other_variants() {
        let err = InferenceError::Timeout { duration_secs: 120 };
        assert!(err.error_body().is_none());
        assert_eq!(err.to_string(), "inference timeout after 120s");
    }

    #[test]
    fn test_config_error_display() {
        let err = InferenceError::ConfigError {
            reason: "ANTHROPIC_API_KEY is not set".into(),
        };
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
