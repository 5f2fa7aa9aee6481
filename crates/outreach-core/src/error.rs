//! Error types and result aliases shared by the outreach crates.

/// The result type used throughout outreach-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building core records.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A lead payload from the campaign platform could not be turned into a typed record.
    #[error("invalid lead payload: {message}")]
    InvalidLead {
        /// Description of the missing or malformed field.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid lead error.
    #[must_use]
    pub fn invalid_lead(message: impl Into<String>) -> Self {
        Self::InvalidLead {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
