//! BDT notification unit (20 bytes).

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{BULK_PACKET_SIZE, BULK_PAYLOAD_SIZE};
use super::mode::CodecError;

/// One bulk data transfer packet: a little-endian sequence number and 16 payload bytes.
///
/// Packet 0 is the header (payload[0..4] = total packet count) and packet
/// `total - 1` is the footer (payload[0..4] = block CRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkPacket {
    pub packet_no: u32,
    pub payload: [u8; BULK_PAYLOAD_SIZE],
}

impl BulkPacket {
    pub const SIZE: usize = BULK_PACKET_SIZE;

    pub fn new(packet_no: u32, payload: [u8; BULK_PAYLOAD_SIZE]) -> Self {
        Self { packet_no, payload }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let packet_no = LittleEndian::read_u32(&data[0..4]);
        let mut payload = [0u8; BULK_PAYLOAD_SIZE];
        payload.copy_from_slice(&data[4..Self::SIZE]);
        Ok(Self { packet_no, payload })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.packet_no.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// First payload word: total packet count on the header, CRC on the footer.
    pub fn lead_word(&self) -> u32 {
        LittleEndian::read_u32(&self.payload[0..4])
    }
}
