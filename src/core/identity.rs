//! Device identity, immutable after `begin`.

use crate::core::error::ConfigError;

/// Length of the textual device id.
pub const DEVICE_ID_HEX_LENGTH: usize = 24;

/// Length of the binary device id.
pub const DEVICE_ID_LENGTH: usize = 12;

/// Identity of the device within the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// 12-byte device id.
    pub device_id: [u8; DEVICE_ID_LENGTH],
    /// Product this device belongs to.
    pub product_id: u16,
    /// Firmware version the product reports.
    pub product_firmware_version: u16,
    /// Hardware platform id.
    pub platform_id: u16,
}

impl DeviceIdentity {
    /// Parse the 24-char hex device id and assemble the identity.
    pub fn new(
        device_id_hex: &str,
        product_id: u16,
        product_firmware_version: u16,
        platform_id: u16,
    ) -> Result<Self, ConfigError> {
        if device_id_hex.is_empty() {
            return Err(ConfigError::InvalidDeviceId("empty".into()));
        }
        if device_id_hex.len() != DEVICE_ID_HEX_LENGTH {
            return Err(ConfigError::InvalidDeviceId(format!(
                "expected {DEVICE_ID_HEX_LENGTH} hex chars, got {}",
                device_id_hex.len()
            )));
        }
        let bytes = hex::decode(device_id_hex)
            .map_err(|e| ConfigError::InvalidDeviceId(e.to_string()))?;
        let mut device_id = [0u8; DEVICE_ID_LENGTH];
        device_id.copy_from_slice(&bytes);
        Ok(Self {
            device_id,
            product_id,
            product_firmware_version,
            platform_id,
        })
    }

    /// The device id as lowercase hex.
    pub fn id_hex(&self) -> String {
        hex::encode(self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_id() {
        let id = DeviceIdentity::new("000102030405060708090a0b", 42, 7, 6).unwrap();
        assert_eq!(
            id.device_id,
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0a, 0x0b]
        );
        assert_eq!(id.id_hex(), "000102030405060708090a0b");
    }

    #[test]
    fn rejects_empty_and_wrong_length() {
        assert!(DeviceIdentity::new("", 0, 0, 0).is_err());
        assert!(DeviceIdentity::new("abc", 0, 0, 0).is_err());
        assert!(DeviceIdentity::new("zz0102030405060708090a0b", 0, 0, 0).is_err());
    }
}
