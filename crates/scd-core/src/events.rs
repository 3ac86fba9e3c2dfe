//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow the session and the relay
//! link without tight coupling to the core logic.

use std::fmt;

use crate::session::SessionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Relay message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Tx,
    Rx,
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageDirection::Tx => write!(f, "TX"),
            MessageDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the session controller and the relay engines.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Radio link established.
    DeviceConnected { address: String },
    /// Radio link lost or closed.
    DeviceDisconnected,
    /// Session state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Bulk transfer progress.
    BdtProgress { received: usize, total: u32 },
    /// Bulk transfer finished and rendered.
    BdtComplete {
        bytes: usize,
        throughput: Option<f64>,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Relay message sent or received.
    Message {
        direction: MessageDirection,
        text: String,
    },
    /// Error occurred.
    Error { message: String },
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait SessionObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DeviceConnected { address } => {
                tracing::info!(address = %address, "Device connected");
            }
            SessionEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            SessionEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            SessionEvent::BdtProgress { received, total } => {
                let pct = if *total > 0 {
                    (*received as u64 * 100) / *total as u64
                } else {
                    0
                };
                tracing::debug!(received, total, progress = %format!("{}%", pct), "BDT progress");
            }
            SessionEvent::BdtComplete { bytes, throughput } => match throughput {
                Some(rate) => {
                    tracing::info!(bytes, rate = %format!("{:.1} B/s", rate), "BDT complete")
                }
                None => tracing::info!(bytes, "BDT complete"),
            },
            SessionEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            SessionEvent::Message { direction, text } => {
                let preview: String = text.chars().take(48).collect();
                tracing::debug!(dir = %direction, len = text.len(), "{}", preview.trim_end());
            }
            SessionEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
        }
    }
}
