//! Experiment session: state machine and device housekeeping.

pub mod controller;
pub mod device;
pub mod state;

pub use controller::{SessionController, SessionSettings, SteStats};
pub use device::DeviceInfo;
pub use state::{SessionError, SessionState};
