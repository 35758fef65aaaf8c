//! Provider error classification.
//!
//! Every model-provider failure is either transient (worth retrying under
//! the orchestrator's bounded budget) or permanent (fails the phase
//! immediately). Classification happens here, at the edge, so the
//! orchestrator's retry policy stays uniform across providers.

use std::time::Duration;

use thiserror::Error;

/// Retryability of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Timeouts, rate limits, 5xx; may succeed on retry.
    Transient,
    /// Bad request, auth failure, unknown model; retrying cannot help.
    Permanent,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A failure from the model provider collaborator.
#[derive(Debug, Clone, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    /// Server-suggested wait before retrying (Retry-After).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            kind: classify_http_status(status),
            message: body.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Map an HTTP status to retryability.
///
/// 408/429 and all 5xx are transient; every other 4xx is permanent.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        408 | 429 => ProviderErrorKind::Transient,
        500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_http_status(429), ProviderErrorKind::Transient);
        assert_eq!(classify_http_status(503), ProviderErrorKind::Transient);
        assert_eq!(classify_http_status(408), ProviderErrorKind::Transient);
        assert_eq!(classify_http_status(400), ProviderErrorKind::Permanent);
        assert_eq!(classify_http_status(401), ProviderErrorKind::Permanent);
        assert_eq!(classify_http_status(404), ProviderErrorKind::Permanent);
    }

    #[test]
    fn constructors_set_kind() {
        assert!(ProviderError::transient("slow").is_transient());
        assert!(!ProviderError::permanent("bad key").is_transient());
        assert!(ProviderError::from_status(502, "bad gateway").is_transient());
    }
}
