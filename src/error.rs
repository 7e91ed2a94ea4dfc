use thiserror::Error;

/// Classification of an upstream failure, derived from the HTTP status where
/// one exists.
///
/// `Validation` is reserved for request-shape failures detected before any
/// provider is contacted; everything else mirrors what the upstream said.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    ServiceUnavailable,
    InvalidRequest,
    Validation,
    Unknown,
}

impl ErrorKind {
    /// HTTP status the gateway answers with for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Auth => 401,
            Self::RateLimit => 429,
            Self::InvalidRequest | Self::Validation => 400,
            Self::ServiceUnavailable => 503,
            Self::Unknown => 500,
        }
    }

    /// OpenAI-style `error.type` string for the wire format.
    pub fn wire_type(self) -> &'static str {
        match self {
            Self::Auth => "authentication_error",
            Self::RateLimit => "rate_limit_error",
            Self::InvalidRequest | Self::Validation => "invalid_request_error",
            Self::ServiceUnavailable | Self::Unknown => "server_error",
        }
    }

    /// OpenAI-style `error.code` string, where one is defined.
    pub fn wire_code(self) -> Option<&'static str> {
        match self {
            Self::Auth => Some("invalid_api_key"),
            Self::RateLimit => Some("rate_limit_exceeded"),
            Self::ServiceUnavailable => Some("service_unavailable"),
            Self::InvalidRequest | Self::Validation | Self::Unknown => None,
        }
    }
}

/// A failure attributed to one provider, normalized from whatever the
/// upstream or an internal stage (limiter, auth) produced.
#[derive(Debug, Clone, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub status: Option<u16>,
    pub message: String,
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl ProviderError {
    /// Classify an upstream HTTP status.
    ///
    /// 401/403 are auth failures, 429 is rate limiting, 5xx is a transient
    /// upstream outage, 400 is a malformed request; anything else is opaque.
    pub fn from_status(provider: &str, status: u16, message: impl Into<String>) -> Self {
        let (kind, retryable) = match status {
            401 | 403 => (ErrorKind::Auth, false),
            429 => (ErrorKind::RateLimit, true),
            500..=599 => (ErrorKind::ServiceUnavailable, true),
            400 => (ErrorKind::InvalidRequest, false),
            _ => (ErrorKind::Unknown, false),
        };
        Self {
            provider: provider.to_string(),
            status: Some(status),
            message: message.into(),
            kind,
            retryable,
        }
    }

    /// Classify a transport-level failure (no HTTP status: connect refused,
    /// timeout, TLS). Treated as a transient outage so the dispatcher can
    /// fall back to the next candidate.
    pub fn transport(provider: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(provider, status.as_u16(), err.to_string());
        }
        Self {
            provider: provider.to_string(),
            status: None,
            message: err.to_string(),
            kind: ErrorKind::ServiceUnavailable,
            retryable: true,
        }
    }

    pub fn auth(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            status: None,
            message: message.into(),
            kind: ErrorKind::Auth,
            retryable: false,
        }
    }

    pub fn rate_limited(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            status: None,
            message: message.into(),
            kind: ErrorKind::RateLimit,
            retryable: false,
        }
    }

    pub fn unavailable(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            status: None,
            message: message.into(),
            kind: ErrorKind::ServiceUnavailable,
            retryable: true,
        }
    }
}

/// Top-level error surfaced to the transport.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::UnknownModel(_) => ErrorKind::Validation,
            Self::Provider(err) => err.kind,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_wire_contract() {
        let auth = ProviderError::from_status("openai", 401, "bad token");
        assert_eq!(auth.kind, ErrorKind::Auth);
        assert!(!auth.retryable);

        let forbidden = ProviderError::from_status("openai", 403, "forbidden");
        assert_eq!(forbidden.kind, ErrorKind::Auth);

        let limited = ProviderError::from_status("openai", 429, "slow down");
        assert_eq!(limited.kind, ErrorKind::RateLimit);
        assert!(limited.retryable);

        let outage = ProviderError::from_status("openai", 502, "bad gateway");
        assert_eq!(outage.kind, ErrorKind::ServiceUnavailable);
        assert!(outage.retryable);

        let bad = ProviderError::from_status("openai", 400, "bad request");
        assert_eq!(bad.kind, ErrorKind::InvalidRequest);
        assert!(!bad.retryable);

        let odd = ProviderError::from_status("openai", 418, "teapot");
        assert_eq!(odd.kind, ErrorKind::Unknown);
        assert!(!odd.retryable);
    }

    #[test]
    fn every_kind_has_a_wire_type() {
        for kind in [
            ErrorKind::Auth,
            ErrorKind::RateLimit,
            ErrorKind::ServiceUnavailable,
            ErrorKind::InvalidRequest,
            ErrorKind::Validation,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.wire_type().is_empty());
        }
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::RateLimit.http_status(), 429);
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorKind::ServiceUnavailable.http_status(), 503);
        assert_eq!(ErrorKind::Unknown.http_status(), 500);
    }

    #[test]
    fn validation_errors_map_to_invalid_request_type() {
        let err = GatewayError::validation("'model' is required and must be a non-empty string");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.kind().wire_type(), "invalid_request_error");
    }
}
