//! Text rendering of a reassembled flash block.
//!
//! Block layout (offsets from the start of the reassembly buffer):
//!
//! ```text
//!   0  16  packet 0 (header)
//!  16   4  start marker 0x55 x4
//!  20  13  container: +1 server unix time, +5 delay ms, +9 accel ODR index
//!  33   .  records: 5-byte header + sample_count x i16
//!   .   2  CRC16
//!   .   4  end marker 0xAA x4
//! ```

use std::fmt::Write as _;

use byteorder::{ByteOrder, LittleEndian};
use chrono::DateTime;
use tracing::debug;

use crate::protocol::CodecError;
use crate::protocol::constants::{
    ACCEL_ODR_HZ, BULK_PAYLOAD_SIZE, CONTAINER_LEN, MARKER_LEN, RECORD_HEADER_LEN,
};

/// Trailer line closing every rendered block.
pub const END_OF_DATA: &str = "End of Data\n";

const CONTAINER_OFFSET: usize = BULK_PAYLOAD_SIZE;
const RECORDS_OFFSET: usize = CONTAINER_OFFSET + MARKER_LEN + CONTAINER_LEN;

/// Samples per output row.
const ROW_SAMPLES: usize = 3;

/// Per-record header packed into five bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub sensor_type: u8,
    /// Device time in milliseconds (24 bits).
    pub timestamp_ms: u32,
    /// Number of i16 samples following the header (12 bits).
    pub sample_count: u16,
}

impl RecordHeader {
    pub fn from_bytes(b: &[u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            sensor_type: b[0] & 0x0F,
            timestamp_ms: (b[0] >> 4) as u32
                | (b[1] as u32) << 4
                | (b[2] as u32) << 12
                | ((b[3] & 0x0F) as u32) << 20,
            sample_count: (b[3] >> 4) as u16 | (b[4] as u16) << 4,
        }
    }
}

/// Container fields stamped by the device at the start of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Container {
    pub server_time: i32,
    pub delay_ms: i32,
    pub odr_index: u8,
}

impl Container {
    pub fn from_block(block: &[u8]) -> Result<Self, CodecError> {
        if block.len() < RECORDS_OFFSET {
            return Err(CodecError::BufferTooSmall {
                expected: RECORDS_OFFSET,
                actual: block.len(),
            });
        }
        let idx = CONTAINER_OFFSET;
        Ok(Self {
            server_time: LittleEndian::read_i32(&block[idx + 5..idx + 9]),
            delay_ms: LittleEndian::read_i32(&block[idx + 9..idx + 13]),
            odr_index: block[idx + 13],
        })
    }

    pub fn odr_hz(&self) -> Result<u32, CodecError> {
        ACCEL_ODR_HZ
            .get(self.odr_index as usize)
            .copied()
            .ok_or(CodecError::InvalidField {
                field: "accelerometer ODR",
                value: self.odr_index as u32,
            })
    }
}

/// Render `block[..end]` as the text the collector stores.
///
/// `end` is the data end returned by the reassembler's end-of-data scan.
pub fn encode(block: &[u8], end: usize) -> Result<String, CodecError> {
    let container = Container::from_block(block)?;
    let end = end.min(block.len());

    let mut out = String::with_capacity(end * 3);
    let stamp = DateTime::from_timestamp(container.server_time as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    let _ = writeln!(out, "server time    : {}({})", stamp, container.server_time);
    let _ = writeln!(out, "delay time     : {:.3}", container.delay_ms as f64 / 1000.0);
    let _ = writeln!(out, "accelometer ODR: {} Hz", container.odr_hz()?);
    out.push_str(" Row #, Time-Stamp, X-AXIS, Y-AXIS, Z-AXIS\n");

    let mut idx = RECORDS_OFFSET;
    let mut row = 1usize;
    let mut records = 0usize;
    while idx + RECORD_HEADER_LEN <= end {
        let mut raw = [0u8; RECORD_HEADER_LEN];
        raw.copy_from_slice(&block[idx..idx + RECORD_HEADER_LEN]);
        let header = RecordHeader::from_bytes(&raw);
        idx += RECORD_HEADER_LEN;
        records += 1;

        let mut written = 0usize;
        for n in 0..header.sample_count as usize {
            if idx + 2 > end {
                break;
            }
            if n == 0 {
                let _ = write!(out, "{:6}, {:10.3}", row, header.timestamp_ms as f64 / 1000.0);
            } else if n % ROW_SAMPLES == 0 {
                row += 1;
                let _ = write!(out, "\n{:6},           ", row);
            }
            let _ = write!(out, ", {:6}", LittleEndian::read_i16(&block[idx..idx + 2]));
            idx += 2;
            written += 1;
        }
        if written > 0 {
            out.push('\n');
            row += 1;
        }
    }
    out.push_str(END_OF_DATA);
    debug!(records, rows = row - 1, bytes = out.len(), "Block rendered");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Block with the given records, returning (block, data end).
    fn block_with(records: &[(u32, &[i16])], odr_index: u8) -> (Vec<u8>, usize) {
        let mut block = vec![0u8; 16];
        block.extend_from_slice(&[0x55; 4]);
        let mut container = [0u8; 13];
        container[1..5].copy_from_slice(&1_607_594_400i32.to_le_bytes());
        container[5..9].copy_from_slice(&250i32.to_le_bytes());
        container[9] = odr_index;
        block.extend_from_slice(&container);
        for (ts, samples) in records {
            let count = samples.len() as u32;
            block.push(0x01 | ((ts & 0x0F) << 4) as u8);
            block.push((ts >> 4) as u8);
            block.push((ts >> 12) as u8);
            block.push(((ts >> 20) & 0x0F) as u8 | ((count & 0x0F) << 4) as u8);
            block.push((count >> 4) as u8);
            for s in *samples {
                block.extend_from_slice(&s.to_le_bytes());
            }
        }
        let end = block.len();
        block.extend_from_slice(&[0x12, 0x34, 0xAA, 0xAA, 0xAA, 0xAA]);
        (block, end)
    }

    #[test]
    fn test_record_header_bit_packing() {
        let h = RecordHeader::from_bytes(&[0x51, 0x34, 0x12, 0x3A, 0x12]);
        assert_eq!(h.sensor_type, 1);
        assert_eq!(h.timestamp_ms, 0xA1_2345);
        assert_eq!(h.sample_count, 0x123);
    }

    #[test]
    fn test_render_two_records() {
        let (block, end) = block_with(
            &[(1234, &[12, -40, 1020, 13, -39, 1019]), (1334, &[1, 2, 3])],
            3,
        );
        let text = encode(&block, end).unwrap();
        let expected = "\
server time    : 2020-12-10 10:00:00(1607594400)
delay time     : 0.250
accelometer ODR: 3200 Hz
 Row #, Time-Stamp, X-AXIS, Y-AXIS, Z-AXIS
     1,      1.234,     12,    -40,   1020
     2,           ,     13,    -39,   1019
     3,      1.334,      1,      2,      3
End of Data
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_truncated_record_stops_at_end() {
        let (block, end) = block_with(&[(0, &[1, 2, 3, 4, 5, 6])], 0);
        let text = encode(&block, end - 4).unwrap();
        assert!(text.contains(
            "     1,      0.000,      1,      2,      3\n     2,           ,      4\n"
        ));
        assert!(text.ends_with(END_OF_DATA));
    }

    #[test]
    fn test_empty_block() {
        let (block, end) = block_with(&[], 0);
        let text = encode(&block, end).unwrap();
        assert!(text.ends_with(" Row #, Time-Stamp, X-AXIS, Y-AXIS, Z-AXIS\nEnd of Data\n"));
    }

    #[test]
    fn test_invalid_odr() {
        let (block, end) = block_with(&[], 9);
        assert!(matches!(
            encode(&block, end),
            Err(CodecError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_short_block() {
        assert!(matches!(
            encode(&[0u8; 20], 20),
            Err(CodecError::BufferTooSmall { .. })
        ));
    }
}
