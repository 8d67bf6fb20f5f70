use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnifferError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Invalid value: {0}")]
    Invalid(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt SSN counter: {0}")]
    CorruptCounter(String),

    #[error("No capture data")]
    NoData,

    #[error("Failed to start sniffer worker: {0}")]
    WorkerStartFailed(String),

    #[error("Short transport write: sent {sent} of {expected} bytes")]
    TransportShortWrite { sent: u64, expected: u64 },

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T, E = SnifferError> = std::result::Result<T, E>;

impl SnifferError {
    /// Numeric status carried in controller replies (errno values).
    pub fn code(&self) -> i32 {
        match self {
            SnifferError::NotFound(_) => 2,
            SnifferError::Io(_) => 5,
            SnifferError::WorkerStartFailed(_) => 8,
            SnifferError::Busy(_) => 16,
            SnifferError::Exists(_) => 17,
            SnifferError::Invalid(_) | SnifferError::Config(_) => 22,
            SnifferError::TransportShortWrite { .. } => 32,
            SnifferError::NoData => 61,
            SnifferError::CorruptCounter(_) => 74,
        }
    }
}
