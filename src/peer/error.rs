use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for PeerError {
    fn from(err: sqlx::Error) -> Self {
        PeerError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::SerializationError(err.to_string())
    }
}

pub type PeerResult<T> = Result<T, PeerError>;
