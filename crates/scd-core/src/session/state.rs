//! Experiment session states.

use std::fmt;

use thiserror::Error;

use crate::protocol::CodecError;
use crate::retry::RetryError;
use crate::transport::TransportError;

/// Lifecycle of the sensor experiment as seen by the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Connected, no experiment running.
    #[default]
    Idle,
    /// STE running without flash writes.
    Monitoring,
    /// STE running with accelerometer samples written to flash.
    Recording,
    /// Flash block transferred or being served to the collector.
    BulkTransferring,
    /// `DEV_CLOSE` received; nothing else is accepted.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Monitoring => write!(f, "MONITORING"),
            SessionState::Recording => write!(f, "RECORDING"),
            SessionState::BulkTransferring => write!(f, "BULK_TRANSFERRING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

impl SessionState {
    /// An STE run is active on the device.
    pub fn is_experiment(&self) -> bool {
        matches!(self, SessionState::Monitoring | SessionState::Recording)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Experiment already running ({0})")]
    AlreadyRunning(SessionState),

    #[error("Session closed")]
    Closed,

    #[error("Mode config read back differs from the one written")]
    ConfigMismatch,

    #[error("Device did not finish command 0x{command:02X}")]
    CommandTimeout { command: u8 },

    #[error("Bulk transfer ended without data")]
    EmptyTransfer,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Reconnect failed: {0}")]
    Reconnect(#[from] RetryError<TransportError>),
}

impl SessionError {
    /// Radio failures that a teardown and reconnect may cure.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_)
                | SessionError::CommandTimeout { .. }
                | SessionError::ConfigMismatch
        )
    }
}
