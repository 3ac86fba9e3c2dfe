//! SCD-Core: control and data relay for SCD BLE sensor devices.
//!
//! This crate drives Short Time Experiments (STE) on an SCD sensor module,
//! pulls recorded flash blocks over the fragmented Bulk Data Transfer (BDT)
//! channel and relays both to a collector over a plain TCP session.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: GATT handles, mode config and sample record codecs
//! - **Transport**: Radio abstraction (scripted mock, simulated device)
//! - **BDT**: Packet reassembly, text rendering and chunking
//! - **Session**: Experiment state machine and device housekeeping
//! - **Relay**: Edge client, collector server, TCP link and HTTP poll
//! - **Events**: Observer pattern for UI decoupling
//! - **Config**: TOML configuration
//!
//! # Example
//!
//! ```no_run
//! use scd_core::session::{SessionController, SessionSettings};
//! use scd_core::transport::SimulatedSensor;
//!
//! let sensor = SimulatedSensor::new("sim");
//! let mut session = SessionController::new(sensor, SessionSettings::default());
//! session.connect().expect("connect failed");
//! session.prepare_device().expect("device not ready");
//! let bytes = session.run_bulk_transfer().expect("BDT failed");
//! println!("{} bytes ready", bytes);
//! ```

pub mod bdt;
pub mod config;
pub mod events;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use bdt::{PacketOutcome, Reassembler, TextBlock};
pub use config::ScdConfig;
pub use events::{LogLevel, SessionEvent, SessionObserver, TracingObserver};
pub use protocol::{BulkPacket, CodecError, ModeConfig, RollingSample};
pub use relay::{RelayClient, RelayError, RelayMessage, RelayServer};
pub use retry::{RetryError, RetryPolicy};
pub use session::{SessionController, SessionError, SessionSettings, SessionState};
pub use transport::{MockTransport, SensorTransport, SimulatedSensor, TransportError};
