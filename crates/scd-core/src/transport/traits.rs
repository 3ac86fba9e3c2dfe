//! Radio transport layer abstraction.
//!
//! Defines the `SensorTransport` trait for attribute-level access to the
//! sensor device, allowing different implementations (BLE stack, mock,
//! simulated device).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed { address: String, message: String },

    #[error("Write to handle {handle} failed: {message}")]
    WriteFailed { handle: u16, message: String },

    #[error("Read from handle {handle} failed: {message}")]
    ReadFailed { handle: u16, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Timeouts are retried in place; everything else calls for a reconnect.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Value notified by the device on a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub handle: u16,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(handle: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            handle,
            data: data.into(),
        }
    }
}

/// Abstract sensor transport interface.
///
/// Notifications are queued by the implementation and handed out only
/// through [`SensorTransport::wait_for_notification`].
pub trait SensorTransport: Send {
    /// Establish the radio link.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear down the radio link. Disconnecting twice is not an error.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Read a characteristic value.
    fn read_characteristic(&mut self, handle: u16) -> Result<Vec<u8>, TransportError>;

    /// Write a characteristic value (with response).
    fn write_characteristic(&mut self, handle: u16, data: &[u8]) -> Result<(), TransportError>;

    /// Block until a notification arrives or `timeout` elapses (`Ok(None)`).
    fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Notification>, TransportError>;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;

    /// Peer address, for logs.
    fn address(&self) -> &str;
}
