//! Device identification read after connecting.

use tracing::{info, warn};

use crate::protocol::constants::*;
use crate::transport::{SensorTransport, TransportError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub system_id: Vec<u8>,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub software_revision: String,
    pub manufacturer: String,
    pub interface_version: Vec<u8>,
    pub self_test: u8,
    pub mode: u8,
}

impl DeviceInfo {
    pub fn read<T: SensorTransport + ?Sized>(transport: &mut T) -> Result<Self, TransportError> {
        let mut text = |handle| -> Result<String, TransportError> {
            let raw = transport.read_characteristic(handle)?;
            Ok(String::from_utf8_lossy(&raw)
                .trim_end_matches('\0')
                .to_string())
        };
        let name = text(DEVICE_NAME_HND)?;
        let serial_number = text(SERIAL_NUM_HND)?;
        let firmware_revision = text(FW_REVISION_HND)?;
        let hardware_revision = text(HW_REVISION_HND)?;
        let software_revision = text(SW_REVISION_HND)?;
        let manufacturer = text(MANUFACTURER_NAME_HND)?;

        let info = Self {
            name,
            system_id: transport.read_characteristic(SYSTEM_ID_HND)?,
            serial_number,
            firmware_revision,
            hardware_revision,
            software_revision,
            manufacturer,
            interface_version: transport.read_characteristic(IF_VERSION_HND)?,
            self_test: first_byte(transport.read_characteristic(TEST_RESULT_HND)?),
            mode: first_byte(transport.read_characteristic(SET_MODE_HND)?),
        };
        info.log();
        Ok(info)
    }

    pub fn self_test_passed(&self) -> bool {
        self.self_test == TEST_RESULT_OK
    }

    fn log(&self) {
        info!(
            name = %self.name,
            serial = %self.serial_number,
            fw = %self.firmware_revision,
            hw = %self.hardware_revision,
            sw = %self.software_revision,
            manufacturer = %self.manufacturer,
            system_id = %hex(&self.system_id),
            interface = %hex(&self.interface_version),
            mode = %format!("0x{:02X}", self.mode),
            "Device information"
        );
        if !self.self_test_passed() {
            warn!(result = %format!("0x{:02X}", self.self_test), "Device self test failed");
        }
    }
}

pub(crate) fn first_byte(raw: Vec<u8>) -> u8 {
    raw.first().copied().unwrap_or_default()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedSensor;

    #[test]
    fn test_read_from_simulated_device() {
        let mut sensor = SimulatedSensor::new("sim");
        sensor.connect().unwrap();
        let info = DeviceInfo::read(&mut sensor).unwrap();
        assert!(info.name.starts_with(TARGET_NAME_PREFIX));
        assert!(info.self_test_passed());
        assert_eq!(info.mode, MODE_SELECTION);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x01, 0xab]), "01.ab");
    }
}
