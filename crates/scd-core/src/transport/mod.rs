//! Transport layer module.

pub mod mock;
pub mod sim;
pub mod traits;

pub use mock::MockTransport;
pub use sim::SimulatedSensor;
pub use traits::{Notification, SensorTransport, TransportError};
