//! SCD device protocol: GATT constants and binary record codecs.

pub mod constants;
pub mod mode;
pub mod packet;
pub mod sample;

pub use mode::{AccelOdr, CodecError, ModeConfig, SensorMask};
pub use packet::BulkPacket;
pub use sample::{RollingSample, SAMPLE_ROW_COLUMNS};
