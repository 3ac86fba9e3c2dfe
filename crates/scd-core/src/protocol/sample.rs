//! STE rolling result record (33 bytes).

use std::fmt::Write as _;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::ROLLING_SAMPLE_SIZE;
use super::mode::CodecError;

/// Number of comma separated columns in a monitoring row (time stamp + 11 values).
pub const SAMPLE_ROW_COLUMNS: usize = 12;

/// One STE rolling result as notified or read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollingSample {
    /// Accelerometer arithmetic mean per axis, in 0.1 units.
    pub accel_mean: [i16; 3],
    /// Accelerometer variance per axis, in 0.01 units.
    pub accel_variance: [i32; 3],
    /// Temperature raw value, 0.0078 degC per LSB.
    pub temperature: i16,
    /// Light in milli-lux.
    pub light: i32,
    /// Magnetometer raw value per axis, 1/16 uT per LSB.
    pub magnet: [i16; 3],
    /// Increments every time the device publishes a new result.
    pub rolling_counter: u8,
}

impl RollingSample {
    pub const SIZE: usize = ROLLING_SAMPLE_SIZE;

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let i16_at = |off: usize| LittleEndian::read_i16(&data[off..off + 2]);
        let i32_at = |off: usize| LittleEndian::read_i32(&data[off..off + 4]);

        Ok(Self {
            accel_mean: [i16_at(0), i16_at(2), i16_at(4)],
            accel_variance: [i32_at(6), i32_at(10), i32_at(14)],
            temperature: i16_at(18),
            light: i32_at(20),
            magnet: [i16_at(24), i16_at(26), i16_at(28)],
            rolling_counter: data[32],
        })
    }

    pub fn to_bytes(&self) -> [u8; ROLLING_SAMPLE_SIZE] {
        let mut buf = [0u8; ROLLING_SAMPLE_SIZE];
        for (i, v) in self.accel_mean.iter().enumerate() {
            LittleEndian::write_i16(&mut buf[i * 2..i * 2 + 2], *v);
        }
        for (i, v) in self.accel_variance.iter().enumerate() {
            LittleEndian::write_i32(&mut buf[6 + i * 4..10 + i * 4], *v);
        }
        LittleEndian::write_i16(&mut buf[18..20], self.temperature);
        LittleEndian::write_i32(&mut buf[20..24], self.light);
        for (i, v) in self.magnet.iter().enumerate() {
            LittleEndian::write_i16(&mut buf[24 + i * 2..26 + i * 2], *v);
        }
        buf[32] = self.rolling_counter;
        buf
    }

    pub fn temperature_celsius(&self) -> f64 {
        self.temperature as f64 * 0.0078
    }

    pub fn light_lux(&self) -> f64 {
        self.light as f64 / 1000.0
    }

    /// Monitoring row sent in reply to `STE_REQ`:
    /// `(<stamp>,mean_x,var_x,mean_y,var_y,mean_z,var_z,temp,light,mag_x,mag_y,mag_z)`.
    pub fn to_row(&self, stamp: &str) -> String {
        let mut row = String::with_capacity(96);
        row.push('(');
        row.push_str(stamp);
        for axis in 0..3 {
            let _ = write!(
                row,
                ",{:.1},{:.2}",
                self.accel_mean[axis] as f64 / 10.0,
                self.accel_variance[axis] as f64 / 100.0
            );
        }
        let _ = write!(
            row,
            ",{:.2},{:.3}",
            self.temperature_celsius(),
            self.light_lux()
        );
        for axis in 0..3 {
            let _ = write!(row, ",{:.1}", self.magnet[axis] as f64 / 16.0);
        }
        row.push(')');
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RollingSample {
        RollingSample {
            accel_mean: [12, -5, 1003],
            accel_variance: [25, 150, 3],
            temperature: 3200,
            light: 123_456,
            magnet: [16, -32, 8],
            rolling_counter: 7,
        }
    }

    #[test]
    fn test_parse_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 33);
        assert_eq!(&bytes[0..2], &12i16.to_le_bytes());
        assert_eq!(&bytes[6..10], &25i32.to_le_bytes());
        assert_eq!(bytes[32], 7);
        assert_eq!(RollingSample::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_row_format() {
        let row = sample().to_row("2020-12-10 10:00:00");
        assert_eq!(
            row,
            "(2020-12-10 10:00:00,1.2,0.25,-0.5,1.50,100.3,0.03,24.96,123.456,1.0,-2.0,0.5)"
        );
        let inner = row.trim_start_matches('(').trim_end_matches(')');
        assert_eq!(inner.split(',').count(), SAMPLE_ROW_COLUMNS);
    }

    #[test]
    fn test_short_record() {
        assert!(matches!(
            RollingSample::from_bytes(&[0u8; 32]),
            Err(CodecError::BufferTooSmall {
                expected: 33,
                actual: 32
            })
        ));
    }
}
