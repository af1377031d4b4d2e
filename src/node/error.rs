use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Cannot send to self")]
    SelfDestination,

    #[error("Node is shut down")]
    ShutDown,

    #[error("Peer error: {0}")]
    PeerError(#[from] crate::peer::PeerError),

    #[error("Transport error: {0}")]
    TransportError(#[from] crate::transport::TransportError),

    #[error("Config error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Delivery error: {0}")]
    DeliveryError(#[from] crate::delivery::DeliveryError),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] crate::metrics::MetricsError),
}

pub type NodeResult<T> = Result<T, NodeError>;
