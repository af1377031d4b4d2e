use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Invalid delivery state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Message already tracked: {0}")]
    AlreadyTracked(String),

    #[error("Only messages addressed to a single peer are tracked")]
    NotDirected,

    #[error("No delivery record for {0}")]
    NotFound(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
