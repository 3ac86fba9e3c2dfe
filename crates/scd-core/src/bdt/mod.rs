//! Bulk data transfer: packet reassembly and text rendering of the flash block.

pub mod chunker;
pub mod reassembler;
pub mod text;

pub use chunker::TextBlock;
pub use reassembler::{PacketOutcome, Reassembler};
pub use text::{END_OF_DATA, encode};
