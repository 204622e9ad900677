use thiserror::Error;

/// Errors that escape the verification engine.
///
/// Payment verdicts are never errors: they travel as
/// [`VerificationOutcome`](crate::outcome::VerificationOutcome) values. These
/// variants cover caller bugs, configuration and storage plumbing.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid payment requirement: {0}")]
    InvalidRequirement(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    StorePoisoned,

    #[error("http error: {0}")]
    HttpError(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
