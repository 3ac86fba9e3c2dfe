//! Protocol constants for the Bosch SCD 110 sensor device.
//!
//! Handles are ATT attribute handles as exposed by the device's GATT table.

// ============================================================================
// Device Identification
// ============================================================================

/// Manufacturer-specific advertisement fragment (AD type 0xFF).
pub const TARGET_MANUFACTURER_TAG: &str = "a6022158";
/// Complete local name prefix (AD type 0x09).
pub const TARGET_NAME_PREFIX: &str = "SCD-";

// ============================================================================
// Characteristic Handles
// ============================================================================

pub const DEVICE_NAME_HND: u16 = 3;
pub const SYSTEM_ID_HND: u16 = 11;
pub const SERIAL_NUM_HND: u16 = 13;
pub const FW_REVISION_HND: u16 = 15;
pub const HW_REVISION_HND: u16 = 17;
pub const SW_REVISION_HND: u16 = 19;
pub const MANUFACTURER_NAME_HND: u16 = 21;
pub const IF_VERSION_HND: u16 = 24;
pub const TEST_RESULT_HND: u16 = 26;

/// Operating mode register (R/W).
pub const SET_MODE_HND: u16 = 28;
/// Generic command register (R/W). Reads back 0x00 once a command completes.
pub const GEN_CMD_HND: u16 = 30;

/// STE mode configuration record (R/W, 35 bytes).
pub const STE_CONFIG_HND: u16 = 35;
/// STE rolling result (R/N, 33 bytes).
pub const STE_RESULT_HND: u16 = 37;
/// Client characteristic configuration descriptor of the STE result.
pub const STE_RESULT_CCCD: u16 = STE_RESULT_HND + 1;

/// BDT control point (W).
pub const BDT_CONTROL_HND: u16 = 41;
/// BDT status (R).
pub const BDT_STATUS_HND: u16 = 43;
/// BDT data flow (R/N, 20-byte packets).
pub const BDT_DATA_FLOW_HND: u16 = 45;
/// Client characteristic configuration descriptor of the BDT data flow.
pub const BDT_DATA_FLOW_CCCD: u16 = BDT_DATA_FLOW_HND + 1;

// ============================================================================
// Register Values
// ============================================================================

/// Mode register value selecting Short Time Experiment.
pub const MODE_STE: u8 = 0x00;
/// Mode register value for mode selection (idle).
pub const MODE_SELECTION: u8 = 0xFF;

/// Toggle STE start/stop.
pub const CMD_TOGGLE_STE: u8 = 0x20;
/// Reset threshold flag.
pub const CMD_RESET_THRESHOLD: u8 = 0x21;
/// Erase recorded sensor data.
pub const CMD_ERASE_FLASH: u8 = 0x30;
/// Generic command register value once the last command completed.
pub const CMD_IDLE: u8 = 0x00;

/// BDT control value starting the transfer.
pub const BDT_START: u8 = 0x01;
/// BDT status while packets are still being sent.
pub const BDT_STATUS_RUNNING: u8 = 0x01;
/// BDT status once the block has been sent.
pub const BDT_STATUS_DONE: u8 = 0x02;

/// CCCD value enabling notifications.
pub const CCCD_NOTIFY: u16 = 0x0001;

/// Self-test result reporting a healthy device.
pub const TEST_RESULT_OK: u8 = 0xC0;

// ============================================================================
// Size Constants
// ============================================================================

/// Maximum ATT MTU negotiated with the device.
pub const MAX_MTU: usize = 65;
/// Device flash size; also the largest transferable block.
pub const MAX_FLASH: usize = 0x0B_0000; // 704 KiB
/// Largest number of 16-byte BDT packets a block may hold.
pub const MAX_PACKETS: usize = MAX_FLASH >> 4;

/// Size of the STE mode configuration record.
pub const MODE_CONFIG_SIZE: usize = 35;
/// Size of the STE rolling result record.
pub const ROLLING_SAMPLE_SIZE: usize = 33;
/// Size of one BDT notification.
pub const BULK_PACKET_SIZE: usize = 20;
/// Payload bytes carried by one BDT packet.
pub const BULK_PAYLOAD_SIZE: usize = 16;

// ============================================================================
// Flash Block Layout
// ============================================================================

/// Start-of-data marker byte (repeated four times).
pub const START_MARKER: u8 = 0x55;
/// End-of-data marker byte (repeated four times).
pub const END_MARKER: u8 = 0xAA;
/// Marker repeat count.
pub const MARKER_LEN: usize = 4;
/// Container record following the start marker.
pub const CONTAINER_LEN: usize = 13;
/// Per-record header: sensor type, timestamp, sample count.
pub const RECORD_HEADER_LEN: usize = 5;
/// CRC16 stored right before the end marker.
pub const BLOCK_CRC_LEN: usize = 2;

/// Accelerometer output data rates selected by the data-rate low nibble.
pub const ACCEL_ODR_HZ: [u32; 5] = [400, 800, 1600, 3200, 6400];
