//! Order-tolerant reassembly of bulk data transfer packets.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::protocol::BulkPacket;
use crate::protocol::constants::{
    BLOCK_CRC_LEN, BULK_PAYLOAD_SIZE, END_MARKER, MARKER_LEN, MAX_FLASH, MAX_PACKETS,
};

/// What happened to one accepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Packet 0: the block size is now known.
    Header { total: u32 },
    /// Payload written at `packet_no * 16`.
    Data { packet_no: u32 },
    /// Packet `total - 1`: payload written, CRC extracted.
    Footer { crc: u32 },
    /// Arrived before the header; replayed once `total` is known.
    Held { packet_no: u32 },
    /// Outside the announced block. Dropped.
    Rejected { packet_no: u32, total: u32 },
}

/// Reassembly buffer plus the bookkeeping of one transfer.
pub struct Reassembler {
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
    total: Option<u32>,
    crc: Option<u32>,
    /// Held until the header arrives, latest copy per packet number.
    pending: BTreeMap<u32, BulkPacket>,
    /// End of the highest region written so far.
    high_water: usize,
    start: Option<Instant>,
    last: Option<Instant>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; MAX_FLASH],
            received: vec![false; MAX_PACKETS],
            received_count: 0,
            total: None,
            crc: None,
            pending: BTreeMap::new(),
            high_water: 0,
            start: None,
            last: None,
        }
    }

    /// Forget the previous transfer.
    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.received.fill(false);
        self.received_count = 0;
        self.total = None;
        self.crc = None;
        self.pending.clear();
        self.high_water = 0;
        self.start = None;
        self.last = None;
    }

    pub fn total(&self) -> Option<u32> {
        self.total
    }

    pub fn crc(&self) -> Option<u32> {
        self.crc
    }

    pub fn received(&self) -> usize {
        self.received_count
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Packets waiting for the header.
    pub fn held(&self) -> usize {
        self.pending.len()
    }

    /// Feed one packet.
    pub fn accept(&mut self, packet: &BulkPacket) -> PacketOutcome {
        let now = Instant::now();
        self.last = Some(now);

        if packet.packet_no == 0 {
            self.start = Some(now);
            let announced = packet.lead_word();
            let total = announced.min(MAX_PACKETS as u32);
            if total != announced {
                warn!(announced, max = MAX_PACKETS, "Block larger than device flash, clamped");
            }
            self.total = Some(total);
            self.write_region(packet);
            debug!(total, held = self.pending.len(), "BDT header received");

            for held in std::mem::take(&mut self.pending).into_values() {
                self.place(&held, total);
            }
            return PacketOutcome::Header { total };
        }

        match self.total {
            Some(total) => self.place(packet, total),
            None if (packet.packet_no as usize) < MAX_PACKETS => {
                self.pending.insert(packet.packet_no, *packet);
                PacketOutcome::Held {
                    packet_no: packet.packet_no,
                }
            }
            None => {
                warn!(packet_no = packet.packet_no, "Packet beyond device flash, dropped");
                PacketOutcome::Rejected {
                    packet_no: packet.packet_no,
                    total: MAX_PACKETS as u32,
                }
            }
        }
    }

    fn place(&mut self, packet: &BulkPacket, total: u32) -> PacketOutcome {
        let packet_no = packet.packet_no;
        if packet_no >= total {
            warn!(packet_no, total, "Packet number out of range, dropped");
            return PacketOutcome::Rejected { packet_no, total };
        }
        self.write_region(packet);
        if packet_no + 1 == total {
            let crc = packet.lead_word();
            self.crc = Some(crc);
            PacketOutcome::Footer { crc }
        } else {
            PacketOutcome::Data { packet_no }
        }
    }

    fn write_region(&mut self, packet: &BulkPacket) {
        let idx = packet.packet_no as usize;
        let offset = idx * BULK_PAYLOAD_SIZE;
        self.buffer[offset..offset + BULK_PAYLOAD_SIZE].copy_from_slice(&packet.payload);
        if !self.received[idx] {
            self.received[idx] = true;
            self.received_count += 1;
        }
        self.high_water = self.high_water.max(offset + BULK_PAYLOAD_SIZE);
    }

    /// Every announced packet has been written.
    pub fn all_received(&self) -> bool {
        self.total
            .is_some_and(|total| self.received_count >= total as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.all_received() || self.find_end_of_data().is_some()
    }

    /// Offset one past the last data byte, i.e. right before the CRC16 trailer.
    ///
    /// Looks for the four-byte end marker near the announced end of the block
    /// first and falls back to the highest written region when `total` is stale.
    pub fn find_end_of_data(&self) -> Option<usize> {
        let total = self.total? as usize;
        let hi = ((total + 1) * BULK_PAYLOAD_SIZE).min(self.buffer.len());
        let lo = total.saturating_sub(3) * BULK_PAYLOAD_SIZE;
        let marker = self
            .scan_marker(lo, hi)
            .or_else(|| self.scan_marker(BULK_PAYLOAD_SIZE, self.high_water))?;
        Some(marker.saturating_sub(BLOCK_CRC_LEN))
    }

    /// Backward scan for `MARKER_LEN` consecutive end-marker bytes in `[lo, hi)`.
    /// Returns the offset of the first marker byte.
    fn scan_marker(&self, lo: usize, hi: usize) -> Option<usize> {
        let mut run = 0;
        for pos in (lo..hi).rev() {
            if self.buffer[pos] == END_MARKER {
                run += 1;
                if run == MARKER_LEN {
                    return Some(pos);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Transfer rate between the header and the latest packet, in bytes/s.
    pub fn throughput(&self) -> Option<f64> {
        let (start, last) = (self.start?, self.last?);
        let secs = last.saturating_duration_since(start).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some((self.received_count * BULK_PAYLOAD_SIZE) as f64 / secs)
    }
}
