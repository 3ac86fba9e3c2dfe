//! Behavioural model of an SCD device.
//!
//! Implements enough of the GATT register semantics (mode selection, STE
//! toggle, flash erase, bulk data transfer) to run the whole edge workflow
//! without a radio.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::traits::{Notification, SensorTransport, TransportError};
use crate::protocol::constants::*;
use crate::protocol::{BulkPacket, ModeConfig, RollingSample};

/// Samples carried by each synthesized flash record.
const SAMPLES_PER_RECORD: usize = 30;
/// Records kept in flash before the simulated recorder stops writing.
const MAX_RECORDS: usize = 256;
/// Interval between records, in device milliseconds.
const RECORD_PERIOD_MS: u32 = 100;
/// Delay stamp written into the container.
const CONTAINER_DELAY_MS: i32 = 250;

/// Simulated SCD sensor.
pub struct SimulatedSensor {
    address: String,
    connected: bool,
    notify_interval: Duration,

    mode: u8,
    gen_cmd: u8,
    /// Reads of the generic command register still reporting the last command.
    busy_reads: u8,
    config: [u8; MODE_CONFIG_SIZE],
    ste_notify: bool,
    bdt_notify: bool,
    running: bool,
    sample: RollingSample,

    /// Accelerometer records captured while recording.
    records: Vec<(u32, Vec<i16>)>,
    /// Container values of the current recording.
    recorded_at: i32,
    recorded_odr: u8,
    flash_used: usize,

    bdt_queue: VecDeque<BulkPacket>,
}

impl SimulatedSensor {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connected: false,
            notify_interval: Duration::from_millis(100),
            mode: MODE_SELECTION,
            gen_cmd: CMD_IDLE,
            busy_reads: 0,
            config: ModeConfig::default().to_bytes(),
            ste_notify: false,
            bdt_notify: false,
            running: false,
            sample: RollingSample::default(),
            records: Vec::new(),
            recorded_at: 0,
            recorded_odr: 0,
            flash_used: 0,
            bdt_queue: VecDeque::new(),
        }
    }

    /// Set the pacing of STE notifications; zero disables sleeping.
    pub fn with_notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = interval;
        self
    }

    /// Put the device in the state of an experiment left running by a previous host.
    pub fn with_experiment_running(mut self) -> Self {
        self.mode = MODE_STE;
        self.running = true;
        self
    }

    /// Put the device in the state of a recording nobody collected.
    pub fn with_stale_recording(mut self, records: usize) -> Self {
        for _ in 0..records {
            self.record_tick();
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn flash_free(&self) -> u32 {
        (MAX_FLASH - self.flash_used) as u32
    }

    /// Simulate a radio link drop.
    pub fn drop_link(&mut self) {
        self.connected = false;
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }

    fn recording(&self) -> bool {
        self.running && self.config[30] & 0x0F != 0
    }

    fn next_sample(&mut self) -> RollingSample {
        let n = self.sample.rolling_counter.wrapping_add(1);
        let wobble = (n % 7) as i16;
        self.sample = RollingSample {
            accel_mean: [3 + wobble, -2, 1000 - wobble],
            accel_variance: [10 + wobble as i32, 8, 12],
            temperature: 3200,
            light: 250_000 + wobble as i32 * 10,
            magnet: [160, -80, 40],
            rolling_counter: n,
        };
        self.sample
    }

    fn record_tick(&mut self) {
        if self.records.len() >= MAX_RECORDS {
            return;
        }
        let base = self.records.len() as i16;
        let samples = (0..SAMPLES_PER_RECORD as i16)
            .map(|i| match i % 3 {
                0 => base + i / 3,
                1 => -40 + i / 3,
                _ => 1020 - i / 3,
            })
            .collect();
        let ts = self.records.len() as u32 * RECORD_PERIOD_MS;
        self.records.push((ts, samples));
        self.flash_used = self.flash_image().len();
    }

    fn toggle_experiment(&mut self) {
        self.running = !self.running;
        if self.running {
            if self.recording() {
                self.records.clear();
                self.flash_used = 0;
                self.recorded_at = LittleEndian::read_i32(&self.config[0..4]);
                self.recorded_odr = self.config[5] & 0x0F;
            }
            debug!(recording = self.recording(), "Simulated STE started");
        } else {
            self.busy_reads = 1;
            debug!(records = self.records.len(), "Simulated STE stopped");
        }
    }

    fn erase_flash(&mut self) {
        self.records.clear();
        self.flash_used = 0;
        self.busy_reads = 1;
    }

    /// Flash content starting at the block offset 16.
    fn flash_image(&self) -> Vec<u8> {
        let mut image = vec![START_MARKER; MARKER_LEN];
        let mut container = [0u8; CONTAINER_LEN];
        container[0] = 0x01;
        LittleEndian::write_i32(&mut container[1..5], self.recorded_at);
        LittleEndian::write_i32(&mut container[5..9], CONTAINER_DELAY_MS);
        container[9] = self.recorded_odr;
        image.extend_from_slice(&container);

        for (ts, samples) in &self.records {
            let count = samples.len() as u32;
            image.push(0x01 | ((ts & 0x0F) << 4) as u8);
            image.push((ts >> 4) as u8);
            image.push((ts >> 12) as u8);
            image.push(((ts >> 20) & 0x0F) as u8 | ((count & 0x0F) << 4) as u8);
            image.push((count >> 4) as u8);
            for s in samples {
                image.extend_from_slice(&s.to_le_bytes());
            }
        }
        let crc = crc16(&image);
        image.extend_from_slice(&crc.to_le_bytes());
        image.extend_from_slice(&[END_MARKER; MARKER_LEN]);
        image
    }

    fn start_bulk_transfer(&mut self) {
        let mut image = self.flash_image();
        let crc = crc16(&image) as u32;
        let pad = (BULK_PAYLOAD_SIZE - image.len() % BULK_PAYLOAD_SIZE) % BULK_PAYLOAD_SIZE;
        image.extend(std::iter::repeat_n(0xFF, pad));

        let data_packets = image.len() / BULK_PAYLOAD_SIZE;
        let total = (data_packets + 2) as u32;

        let mut packets = Vec::with_capacity(total as usize);
        let mut header = [0u8; BULK_PAYLOAD_SIZE];
        LittleEndian::write_u32(&mut header[0..4], total);
        packets.push(BulkPacket::new(0, header));
        for (i, chunk) in image.chunks(BULK_PAYLOAD_SIZE).enumerate() {
            let mut payload = [0u8; BULK_PAYLOAD_SIZE];
            payload.copy_from_slice(chunk);
            packets.push(BulkPacket::new(i as u32 + 1, payload));
        }
        let mut footer = [0u8; BULK_PAYLOAD_SIZE];
        LittleEndian::write_u32(&mut footer[0..4], crc);
        packets.push(BulkPacket::new(total - 1, footer));

        // The radio stack does not keep notification order.
        packets.swap(0, 1);
        if packets.len() > 4 {
            packets.swap(2, 3);
        }
        debug!(total, "Simulated BDT started");
        self.bdt_queue = packets.into();
    }
}

impl SensorTransport for SimulatedSensor {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.ste_notify = false;
        self.bdt_notify = false;
        Ok(())
    }

    fn read_characteristic(&mut self, handle: u16) -> Result<Vec<u8>, TransportError> {
        self.check_link()?;
        let value = match handle {
            DEVICE_NAME_HND => b"SCD-110 SIM".to_vec(),
            SYSTEM_ID_HND => vec![0x01, 0x02, 0x03, 0xFF, 0xFE, 0x04, 0x05, 0x06],
            SERIAL_NUM_HND => b"SIM0001".to_vec(),
            FW_REVISION_HND => b"1.0.0".to_vec(),
            HW_REVISION_HND => b"B1".to_vec(),
            SW_REVISION_HND => b"1.0.0".to_vec(),
            MANUFACTURER_NAME_HND => b"Bosch Connected Devices and Solutions".to_vec(),
            IF_VERSION_HND => vec![0x01, 0x00],
            TEST_RESULT_HND => vec![TEST_RESULT_OK],
            SET_MODE_HND => vec![self.mode],
            GEN_CMD_HND => {
                if self.busy_reads > 0 {
                    self.busy_reads -= 1;
                    vec![self.gen_cmd]
                } else {
                    vec![CMD_IDLE]
                }
            }
            STE_CONFIG_HND => {
                let mut config = self.config;
                LittleEndian::write_u32(&mut config[31..35], self.flash_free());
                config.to_vec()
            }
            STE_RESULT_HND => {
                if self.running {
                    self.next_sample();
                }
                self.sample.to_bytes().to_vec()
            }
            BDT_STATUS_HND => {
                if self.bdt_queue.is_empty() {
                    vec![BDT_STATUS_DONE]
                } else {
                    vec![BDT_STATUS_RUNNING]
                }
            }
            _ => {
                return Err(TransportError::ReadFailed {
                    handle,
                    message: "unknown handle".into(),
                });
            }
        };
        trace!(handle, len = value.len(), "Simulated read");
        Ok(value)
    }

    fn write_characteristic(&mut self, handle: u16, data: &[u8]) -> Result<(), TransportError> {
        self.check_link()?;
        let first = data.first().copied().unwrap_or_default();
        match handle {
            SET_MODE_HND => self.mode = first,
            GEN_CMD_HND => {
                self.gen_cmd = first;
                match first {
                    CMD_TOGGLE_STE if self.mode == MODE_STE => self.toggle_experiment(),
                    CMD_ERASE_FLASH => self.erase_flash(),
                    _ => {}
                }
            }
            STE_CONFIG_HND if data.len() >= MODE_CONFIG_SIZE => {
                self.config.copy_from_slice(&data[..MODE_CONFIG_SIZE]);
            }
            STE_RESULT_CCCD => self.ste_notify = first & 0x01 != 0,
            BDT_DATA_FLOW_CCCD => self.bdt_notify = first & 0x01 != 0,
            BDT_CONTROL_HND if first == BDT_START => self.start_bulk_transfer(),
            _ => {
                return Err(TransportError::WriteFailed {
                    handle,
                    message: "not writable".into(),
                });
            }
        }
        trace!(handle, len = data.len(), "Simulated write");
        Ok(())
    }

    fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Notification>, TransportError> {
        self.check_link()?;
        if self.bdt_notify
            && let Some(pkt) = self.bdt_queue.pop_front()
        {
            return Ok(Some(Notification::new(BDT_DATA_FLOW_HND, pkt.to_bytes())));
        }

        let pause = timeout.min(self.notify_interval);
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        if !self.running {
            return Ok(None);
        }
        if self.recording() {
            self.record_tick();
        }
        if self.ste_notify {
            let sample = self.next_sample();
            return Ok(Some(Notification::new(
                STE_RESULT_HND,
                sample.to_bytes().to_vec(),
            )));
        }
        Ok(None)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// CRC-16/CCITT-FALSE over the flash image.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor() -> SimulatedSensor {
        let mut s = SimulatedSensor::new("sim").with_notify_interval(Duration::ZERO);
        s.connect().unwrap();
        s
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_toggle_requires_ste_mode() {
        let mut s = sensor();
        s.write_characteristic(GEN_CMD_HND, &[CMD_TOGGLE_STE]).unwrap();
        assert!(!s.is_running());

        s.write_characteristic(SET_MODE_HND, &[MODE_STE]).unwrap();
        s.write_characteristic(GEN_CMD_HND, &[CMD_TOGGLE_STE]).unwrap();
        assert!(s.is_running());
    }

    #[test]
    fn test_rolling_counter_advances_while_running() {
        let mut s = sensor().with_experiment_running();
        let a = s.read_characteristic(STE_RESULT_HND).unwrap();
        let b = s.read_characteristic(STE_RESULT_HND).unwrap();
        assert_ne!(a[32], b[32]);
    }

    #[test]
    fn test_recording_fills_flash() {
        let mut s = sensor();
        let config = ModeConfig::default().for_run(1_600_000_000, true);
        s.write_characteristic(STE_CONFIG_HND, &config.to_bytes()).unwrap();
        s.write_characteristic(SET_MODE_HND, &[MODE_STE]).unwrap();
        s.write_characteristic(GEN_CMD_HND, &[CMD_TOGGLE_STE]).unwrap();
        for _ in 0..3 {
            s.wait_for_notification(Duration::ZERO).unwrap();
        }
        s.write_characteristic(GEN_CMD_HND, &[CMD_TOGGLE_STE]).unwrap();

        let read = s.read_characteristic(STE_CONFIG_HND).unwrap();
        let parsed = ModeConfig::from_bytes(&read).unwrap();
        assert!(parsed.flash_in_use());

        s.write_characteristic(GEN_CMD_HND, &[CMD_ERASE_FLASH]).unwrap();
        assert_eq!(s.flash_free() as usize, MAX_FLASH);
    }

    #[test]
    fn test_bulk_transfer_packets() {
        let mut s = sensor().with_stale_recording(2);
        s.write_characteristic(BDT_DATA_FLOW_CCCD, &CCCD_NOTIFY.to_le_bytes())
            .unwrap();
        s.write_characteristic(BDT_CONTROL_HND, &[BDT_START]).unwrap();
        assert_eq!(
            s.read_characteristic(BDT_STATUS_HND).unwrap(),
            vec![BDT_STATUS_RUNNING]
        );

        let mut packets = Vec::new();
        while let Some(n) = s.wait_for_notification(Duration::ZERO).unwrap() {
            assert_eq!(n.handle, BDT_DATA_FLOW_HND);
            packets.push(BulkPacket::from_bytes(&n.data).unwrap());
        }
        let header = packets.iter().find(|p| p.packet_no == 0).unwrap();
        assert_eq!(header.lead_word() as usize, packets.len());
        assert_eq!(packets[0].packet_no, 1);
        assert_eq!(
            s.read_characteristic(BDT_STATUS_HND).unwrap(),
            vec![BDT_STATUS_DONE]
        );
    }
}
