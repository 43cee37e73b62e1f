use thiserror::Error;

pub type RegistrySyncResult<T> = Result<T, RegistrySyncError>;

#[derive(Debug, Error)]
pub enum RegistrySyncError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Registry API error for {resource} {id}: {message}")]
    ExternalApiError {
        resource: String,
        id: String,
        status: Option<u16>,
        message: String
    },

    #[error("Rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Unexpected response payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Scheduler error: {0}")]
    SchedulerError(String)
}

impl RegistrySyncError {
    pub fn external(
        resource: &str,
        id: &str,
        status: Option<u16>,
        message: impl ToString
    ) -> Self {
        Self::ExternalApiError {
            resource: resource.to_string(),
            id: id.to_string(),
            status,
            message: message.to_string()
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited { .. } => true,
            Self::DatabaseError(sqlx::Error::PoolTimedOut) => true,
            Self::ExternalApiError {
                status: Some(status),
                ..
            } => *status >= 500 || *status == 429,
            Self::ExternalApiError { status: None, .. } => true,
            _ => false
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        if let Self::RateLimited {
            retry_after_seconds
        } = self
        {
            Some(*retry_after_seconds)
        } else {
            None
        }
    }

    /// Upstream HTTP status, when the failure came from the registry.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ExternalApiError { status, .. } => *status,
            Self::HttpError(e) => e.status().map(|s| s.as_u16()),
            Self::RateLimited { .. } => Some(429),
            _ => None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_is_retryable() {
        let err = RegistrySyncError::RateLimited {
            retry_after_seconds: 2
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(2));
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn test_external_api_error_retryability_follows_status() {
        let server = RegistrySyncError::external("enhet", "123456789", Some(503), "unavailable");
        assert!(server.is_retryable());

        let client = RegistrySyncError::external("enhet", "123456789", Some(400), "bad request");
        assert!(!client.is_retryable());
        assert_eq!(client.status(), Some(400));
    }

    #[test]
    fn test_validation_error_is_not_retryable() {
        let err = RegistrySyncError::ValidationError("bad orgnr".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
        assert!(err.to_string().contains("bad orgnr"));
    }
}
