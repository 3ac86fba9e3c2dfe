//! Relay between the edge (sensor side) and the collector.
//!
//! Plain ASCII messages over one persistent TCP connection. The edge runs
//! [`RelayClient`] on top of a session controller; the collector runs
//! [`RelayServer`].

pub mod capture;
pub mod client;
pub mod error;
pub mod link;
pub mod message;
pub mod poll;
pub mod server;

pub use capture::{Capture, CaptureRow};
pub use client::{ClientSettings, LinkConnector, RelayClient};
pub use error::RelayError;
pub use link::{MessageLink, TcpLink};
pub use message::RelayMessage;
pub use poll::{HttpPoller, PollChannel};
pub use server::{
    BDT_BUSY, BdtReply, CallerId, LinkAcceptor, LockTable, MonitorReply, RelayServer,
    ServerSettings, TcpAcceptor, VibrationStatus,
};
