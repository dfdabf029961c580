use thiserror::Error;

#[derive(Error, Debug)]
pub enum NomadToolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Nomad error: {0}")]
    Nomad(#[from] consensus::NomadError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NomadToolError>;
