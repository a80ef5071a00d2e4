//! Protocol errors

use thiserror::Error;

use crate::session::SessionState;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Not connected to attendance device")]
    NotConnected,

    #[error("Attendance device is connected but not ready")]
    NotReady,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No matching attendance device found")]
    DeviceNotFound,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Bridge has shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        ProtocolError::SerialError(e.to_string())
    }
}
