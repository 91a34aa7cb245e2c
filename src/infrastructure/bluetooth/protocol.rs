//! GATT protocol constants
//!
//! Well-known uuids and descriptor values used by the session core, plus
//! textual uuid parsing.

use crate::domain::models::CharacteristicKey;
use crate::error::BleError;
use uuid::Uuid;

/// Bluetooth base uuid `00000000-0000-1000-8000-00805F9B34FB`
pub const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Battery Service
pub const BATTERY_SERVICE: u16 = 0x180F;
/// Battery Level characteristic
pub const BATTERY_LEVEL: u16 = 0x2A19;
/// Device Information Service
pub const DEVICE_INFORMATION_SERVICE: u16 = 0x180A;
/// Manufacturer Name String characteristic
pub const MANUFACTURER_NAME: u16 = 0x2A29;

/// Client Characteristic Configuration Descriptor
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x2902;

/// CCCD values (little-endian)
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expand a 16- or 32-bit assigned number onto the base uuid.
pub const fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

pub fn cccd_uuid() -> Uuid {
    uuid_from_short(CLIENT_CHARACTERISTIC_CONFIGURATION as u32)
}

pub fn battery_level_key() -> CharacteristicKey {
    CharacteristicKey::new(
        uuid_from_short(BATTERY_SERVICE as u32),
        uuid_from_short(BATTERY_LEVEL as u32),
    )
}

pub fn manufacturer_name_key() -> CharacteristicKey {
    CharacteristicKey::new(
        uuid_from_short(DEVICE_INFORMATION_SERVICE as u32),
        uuid_from_short(MANUFACTURER_NAME as u32),
    )
}

/// Parse a uuid string
///
/// Accepts the 128-bit hyphenated form, 32 bare hex digits, or a 4/8 digit
/// short form ("180F", "0x2A19") which is expanded onto the base uuid.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, BleError> {
    let trimmed = uuid_str.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match hex.len() {
        4 | 8 => u32::from_str_radix(hex, 16)
            .map(uuid_from_short)
            .map_err(|_| BleError::InvalidAddress(uuid_str.to_string())),
        _ => Uuid::parse_str(hex).map_err(|_| BleError::InvalidAddress(uuid_str.to_string())),
    }
}
