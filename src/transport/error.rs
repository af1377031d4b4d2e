use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Bad frame magic")]
    BadMagic,

    #[error("Unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("QUIC error: {0}")]
    QuicError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(err: quinn::ConnectionError) -> Self {
        TransportError::QuicError(err.to_string())
    }
}

impl From<quinn::WriteError> for TransportError {
    fn from(err: quinn::WriteError) -> Self {
        TransportError::SendFailed(err.to_string())
    }
}

impl From<quinn::ReadToEndError> for TransportError {
    fn from(err: quinn::ReadToEndError) -> Self {
        TransportError::ReceiveFailed(err.to_string())
    }
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        TransportError::SerializationError(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
