use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("board is not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("no WaveDAC board answered on {port}")]
    DeviceNotFound { port: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("read loop failed: {0}")]
    Worker(String),
}

impl DriverError {
    /// Whether the error means the byte source is gone and a reconnect is needed.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DriverError::NotConnected | DriverError::ConnectionLost(_) | DriverError::Serial(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
