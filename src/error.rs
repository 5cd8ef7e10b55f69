use thiserror::Error;

pub type Result<T> = std::result::Result<T, MxblError>;

/// Errors surfaced by the engine and its collaborators.
///
/// Cloneable so that every caller coalesced onto one in-flight lookup can
/// receive the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MxblError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("no entry found for id: {0}")]
    PatternNotFound(u64),

    #[error("no domain in '{0}'")]
    InvalidAddress(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MxblError {
    pub fn invalid_pattern(pattern: &str, reason: impl ToString) -> Self {
        MxblError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for MxblError {
    fn from(e: rusqlite::Error) -> Self {
        MxblError::Store(e.to_string())
    }
}
