use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Upstream rejected credentials with status {0}")]
    Unauthorized(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True when the failure is a unique-constraint hit, which the store
    /// treats as an already-applied write.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// True when an issuer or API refused the configured credentials.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            Error::Validation("missing id".to_string()).to_string(),
            "Validation error: missing id"
        );
        assert_eq!(
            Error::Unauthorized(401).to_string(),
            "Upstream rejected credentials with status 401"
        );
    }

    #[test]
    fn test_credential_rejection() {
        assert!(Error::Unauthorized(401).is_credential_rejection());
        assert!(!Error::Auth("token request failed with status 502".to_string())
            .is_credential_rejection());
        assert!(!Error::ChannelSend.is_credential_rejection());
    }

    #[test]
    fn test_non_database_error_is_not_unique_violation() {
        assert!(!Error::ChannelSend.is_unique_violation());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_unique_violation());
    }
}
