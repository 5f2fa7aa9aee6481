//! Error types for the drain engine.

/// The result type used throughout outreach-drain.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed outbound API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    Server,
    /// HTTP 404.
    NotFound,
    /// Any other 4xx.
    Client,
    /// The call exceeded its timeout.
    Timeout,
    /// Connection-level failure before a status was received.
    Transport,
    /// A success response whose body could not be decoded.
    Decode,
}

impl ApiErrorKind {
    /// Classifies an HTTP status code that is not a success.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            429 => Self::RateLimited,
            404 => Self::NotFound,
            500..=599 => Self::Server,
            _ => Self::Client,
        }
    }

    /// Returns true if the failure is worth retrying locally.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server | Self::Timeout | Self::Transport
        )
    }
}

/// Errors that can occur in drain operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A campaign API call failed.
    #[error("campaign API error ({kind:?}, status={status:?}): {message}")]
    Api {
        /// Failure classification.
        kind: ApiErrorKind,
        /// HTTP status, when one was received.
        status: Option<u16>,
        /// Description of the failure.
        message: String,
    },

    /// A state store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from outreach-core.
    #[error("core error: {0}")]
    Core(#[from] outreach_core::error::Error),
}

impl Error {
    /// Creates an API error from a non-success HTTP status.
    #[must_use]
    pub fn api_status(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            kind: ApiErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Creates an API error for a failure that produced no status.
    #[must_use]
    pub fn api(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self::Api {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns the API failure classification, if this is an API error.
    #[must_use]
    pub const fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            Self::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub const fn http_status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns true for transient API failures (429, 5xx, timeouts, transport).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.api_kind().is_some_and(ApiErrorKind::is_retryable)
    }

    /// Returns true if the platform answered 429.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.api_kind() == Some(ApiErrorKind::RateLimited)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::api_status(status.as_u16(), err.to_string());
        }
        let kind = if err.is_timeout() {
            ApiErrorKind::Timeout
        } else if err.is_decode() {
            ApiErrorKind::Decode
        } else {
            ApiErrorKind::Transport
        };
        Self::api(kind, err.to_string())
    }
}
