//! Error types for Plumage

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlumageError>;

#[derive(Error, Debug)]
pub enum PlumageError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl PlumageError {
    /// Whether the failed operation may succeed on a later attempt.
    ///
    /// Rate-limited and transient network failures are worth retrying;
    /// everything else is either permanent or needs operator attention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlumageError::Network(NetworkError::Transient(_))
                | PlumageError::Network(NetworkError::RateLimited { .. })
        )
    }

    /// Server-suggested wait before retrying, if one was given.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PlumageError::Network(NetworkError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {reason}")]
    InvalidVar { var: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No active session for user {0}")]
    NoSession(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Authorization state missing or expired")]
    StateInvalid,

    #[error("Code verifier does not match stored authorization state")]
    VerifierMismatch,

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Refresh rejected by the authorization server: {0}")]
    RefreshRejected(String),

    #[error("Server nonce renegotiation failed after retry")]
    NonceRetryExhausted,

    #[error("Identity lookup failed: {0}")]
    IdentityFetch(String),

    #[error("Stored session material could not be decrypted: {0}")]
    CryptoFailure(String),

    #[error("DPoP key error: {0}")]
    DpopKey(String),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Transient network failure: {0}")]
    Transient(String),

    #[error("Request rejected ({status}): {body}")]
    Permanent { status: u16, body: String },
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption key must be at least {min} bytes, got {got}")]
    KeyTooShort { min: usize, got: usize },

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Stored ciphertext is malformed: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_rate_limited_are_retryable() {
        let transient = PlumageError::Network(NetworkError::Transient("503".to_string()));
        assert!(transient.is_retryable());

        let limited = PlumageError::Network(NetworkError::RateLimited {
            retry_after_secs: 60,
        });
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after_secs(), Some(60));
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        let permanent = PlumageError::Network(NetworkError::Permanent {
            status: 400,
            body: "InvalidRequest".to_string(),
        });
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.retry_after_secs(), None);

        let auth = PlumageError::Auth(AuthError::RefreshRejected("invalid_grant".to_string()));
        assert!(!auth.is_retryable());

        let forbidden = PlumageError::Forbidden("user mismatch".to_string());
        assert!(!forbidden.is_retryable());
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!PlumageError::Cancelled.is_retryable());
    }

    #[test]
    fn error_messages_name_the_failing_layer() {
        let err = PlumageError::Auth(AuthError::NonceRetryExhausted);
        assert!(err.to_string().contains("nonce"));

        let err = PlumageError::Crypto(CryptoError::KeyTooShort { min: 32, got: 8 });
        assert!(err.to_string().contains("32"));
    }
}
