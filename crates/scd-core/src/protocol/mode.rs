//! STE mode configuration record (35 bytes).
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | unix time (i32)                         |
//! | 4      | 1    | sensor enable, `0xF0 \| mask`           |
//! | 5      | 1    | data rate (ODR index, light ODR bit)    |
//! | 6      | 2    | accelerometer threshold                 |
//! | 12     | 4    | light threshold low                     |
//! | 16     | 4    | light threshold high                    |
//! | 20     | 2    | magnetometer threshold                  |
//! | 26     | 2    | temperature threshold low               |
//! | 28     | 2    | temperature threshold high              |
//! | 30     | 1    | flash write, `0xF0 \| mask`             |
//! | 31     | 4    | flash free bytes (device reported)      |
//!
//! Bytes 8..12 and 22..26 are reserved and always written as zero.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{ACCEL_ODR_HZ, MAX_FLASH, MODE_CONFIG_SIZE};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid {field}: 0x{value:02X}")]
    InvalidField { field: &'static str, value: u32 },
}

/// Set of on-board sensors.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SensorMask(u8);

impl SensorMask {
    pub const NONE: Self = Self(0x00);
    pub const ACCELEROMETER: Self = Self(0x01);
    pub const MAGNETOMETER: Self = Self(0x02);
    pub const LIGHT: Self = Self(0x04);
    pub const TEMPERATURE: Self = Self(0x08);
    pub const ALL: Self = Self(0x0F);

    /// Build from the low nibble of a register byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Register encoding: the high nibble is always set.
    const fn register(self) -> u8 {
        0xF0 | self.0
    }
}

impl fmt::Debug for SensorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::ACCELEROMETER, "accel"),
            (Self::MAGNETOMETER, "mag"),
            (Self::LIGHT, "light"),
            (Self::TEMPERATURE, "temp"),
        ]
        .iter()
        .filter(|(m, _)| self.contains(*m))
        .map(|(_, n)| *n)
        .collect();
        write!(f, "SensorMask({})", names.join("|"))
    }
}

/// Accelerometer output data rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelOdr {
    #[default]
    Hz400,
    Hz800,
    Hz1600,
    Hz3200,
    Hz6400,
}

impl AccelOdr {
    const ALL: [AccelOdr; 5] = [
        AccelOdr::Hz400,
        AccelOdr::Hz800,
        AccelOdr::Hz1600,
        AccelOdr::Hz3200,
        AccelOdr::Hz6400,
    ];

    /// Index as stored in the data-rate low nibble.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn hz(self) -> u32 {
        ACCEL_ODR_HZ[self as usize]
    }

    pub fn from_hz(hz: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|odr| odr.hz() == hz)
    }
}

/// Decoded STE mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeConfig {
    pub timestamp: i32,
    pub sensors: SensorMask,
    pub accel_odr: AccelOdr,
    /// Light sensor at 800 ms instead of 100 ms.
    pub light_odr_slow: bool,
    pub accel_threshold: u16,
    pub light_threshold_low: u32,
    pub light_threshold_high: u32,
    pub magnet_threshold: u16,
    pub temp_threshold_low: u16,
    pub temp_threshold_high: u16,
    /// Sensors whose raw values are written to flash. Empty means notify only.
    pub flash_sensors: SensorMask,
    /// Free flash bytes as reported by the device; `MAX_FLASH` when empty.
    pub flash_free: u32,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            timestamp: 0,
            sensors: SensorMask::ALL,
            accel_odr: AccelOdr::Hz400,
            light_odr_slow: false,
            accel_threshold: 0x07E4,
            light_threshold_low: 0,
            light_threshold_high: 0x05F5_E4E8,
            magnet_threshold: 0x5780,
            temp_threshold_low: 0xF380,
            temp_threshold_high: 0x2D00,
            flash_sensors: SensorMask::NONE,
            flash_free: 0,
        }
    }
}

impl ModeConfig {
    pub const SIZE: usize = MODE_CONFIG_SIZE;

    /// Copy of this config stamped with `timestamp` and the flash mode for a run.
    pub fn for_run(&self, timestamp: i32, persist: bool) -> Self {
        Self {
            timestamp,
            flash_sensors: if persist {
                SensorMask::ACCELEROMETER
            } else {
                SensorMask::NONE
            },
            ..*self
        }
    }

    /// Whether sensor raw values will be written to flash.
    pub fn writes_flash(&self) -> bool {
        !self.flash_sensors.is_empty()
    }

    /// Whether the device reported recorded data still sitting in flash.
    pub fn flash_in_use(&self) -> bool {
        (self.flash_free as usize) < MAX_FLASH
    }

    pub fn to_bytes(&self) -> [u8; MODE_CONFIG_SIZE] {
        let mut buf = [0u8; MODE_CONFIG_SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.timestamp);
        buf[4] = self.sensors.register();
        buf[5] = self.accel_odr.index() | if self.light_odr_slow { 0x10 } else { 0x00 };
        LittleEndian::write_u16(&mut buf[6..8], self.accel_threshold);
        LittleEndian::write_u32(&mut buf[12..16], self.light_threshold_low);
        LittleEndian::write_u32(&mut buf[16..20], self.light_threshold_high);
        LittleEndian::write_u16(&mut buf[20..22], self.magnet_threshold);
        LittleEndian::write_u16(&mut buf[26..28], self.temp_threshold_low);
        LittleEndian::write_u16(&mut buf[28..30], self.temp_threshold_high);
        buf[30] = self.flash_sensors.register();
        LittleEndian::write_u32(&mut buf[31..35], self.flash_free);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MODE_CONFIG_SIZE {
            return Err(CodecError::BufferTooSmall {
                expected: MODE_CONFIG_SIZE,
                actual: data.len(),
            });
        }
        let rate = data[5];
        let accel_odr = AccelOdr::from_index(rate & 0x0F).ok_or(CodecError::InvalidField {
            field: "accelerometer ODR",
            value: rate as u32,
        })?;

        Ok(Self {
            timestamp: LittleEndian::read_i32(&data[0..4]),
            sensors: SensorMask::from_bits(data[4]),
            accel_odr,
            light_odr_slow: rate & 0x10 != 0,
            accel_threshold: LittleEndian::read_u16(&data[6..8]),
            light_threshold_low: LittleEndian::read_u32(&data[12..16]),
            light_threshold_high: LittleEndian::read_u32(&data[16..20]),
            magnet_threshold: LittleEndian::read_u16(&data[20..22]),
            temp_threshold_low: LittleEndian::read_u16(&data[26..28]),
            temp_threshold_high: LittleEndian::read_u16(&data[28..30]),
            flash_sensors: SensorMask::from_bits(data[30]),
            flash_free: LittleEndian::read_u32(&data[31..35]),
        })
    }

    /// Compare the fields the host writes, ignoring the device-owned flash counter.
    pub fn matches_written(&self, other: &ModeConfig) -> bool {
        Self {
            flash_free: 0,
            ..*self
        } == Self {
            flash_free: 0,
            ..*other
        }
    }
}
