use thiserror::Error;

/// kra error types
#[derive(Error, Debug)]
pub enum KraError {
    /// Image is not known to the local container runtime
    #[error("Image not found locally: {reference}")]
    NotFoundLocally { reference: String },

    /// Export stream or one of its entries could not be decoded
    #[error("Archive decode error: {0}")]
    ArchiveDecode(String),

    /// Remote side reported different content than what was sent
    #[error("Integrity mismatch for {object}: expected {expected}, remote reported {actual}")]
    IntegrityMismatch {
        object: String,
        expected: String,
        actual: String,
    },

    /// Network failure talking to the remote API
    #[error("Transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Remote API returned a non-success status
    #[error("API error: {endpoint} -> {status} - {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Remote catalog rejected the image descriptor
    #[error("Registration of {reference} failed: {message}")]
    Registration { reference: String, message: String },

    /// Local container runtime command failed
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operation was interrupted by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KraError {
    /// Whether the error is the layer store's "already present" answer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KraError::Api { status: 409, .. })
    }
}

impl From<serde_json::Error> for KraError {
    fn from(err: serde_json::Error) -> Self {
        KraError::SerializationError(err.to_string())
    }
}

/// Result type alias for kra operations
pub type Result<T> = std::result::Result<T, KraError>;
