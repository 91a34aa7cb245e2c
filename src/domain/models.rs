use crate::error::BleError;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A peripheral seen during scanning. Equality is by address only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
}

impl Device {
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name,
            rssi,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

/// Addresses a characteristic by its `(service uuid, characteristic uuid)` pair.
///
/// Characteristic uuids repeat across services, so lookups always go
/// through the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicKey {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// Build a key from textual uuids, accepting the 16/32-bit short forms.
    pub fn parse(service: &str, characteristic: &str) -> Result<Self, BleError> {
        Ok(Self {
            service: protocol::parse_uuid(service)?,
            characteristic: protocol::parse_uuid(characteristic)?,
        })
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.characteristic)
    }
}

impl FromStr for CharacteristicKey {
    type Err = BleError;

    /// Parse the external `serviceUuid:characteristicUuid` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, characteristic) = s
            .split_once(':')
            .ok_or_else(|| BleError::InvalidAddress(s.to_string()))?;
        Self::parse(service.trim(), characteristic.trim())
    }
}

/// GATT capability flags of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    /// Decode the standard GATT characteristic property bit mask.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & Self::READ != 0,
            write: bits & Self::WRITE != 0,
            write_without_response: bits & Self::WRITE_WITHOUT_RESPONSE != 0,
            notify: bits & Self::NOTIFY != 0,
            indicate: bits & Self::INDICATE != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.read {
            bits |= Self::READ;
        }
        if self.write_without_response {
            bits |= Self::WRITE_WITHOUT_RESPONSE;
        }
        if self.write {
            bits |= Self::WRITE;
        }
        if self.notify {
            bits |= Self::NOTIFY;
        }
        if self.indicate {
            bits |= Self::INDICATE;
        }
        bits
    }

    /// Whether these flags permit an operation of the given kind.
    pub fn supports(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Read => self.read,
            OperationKind::Write => self.write || self.write_without_response,
            OperationKind::SetNotify => self.notify || self.indicate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
}

impl Characteristic {
    pub fn new(service_uuid: Uuid, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            service_uuid,
            properties,
            value: None,
        }
    }

    pub fn key(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.service_uuid, self.uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Builder helper: append a characteristic owned by this service.
    pub fn with_characteristic(mut self, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        self.characteristics
            .push(Characteristic::new(self.uuid, uuid, properties));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Read,
    Write,
    SetNotify,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::SetNotify => "notify",
        };
        f.write_str(name)
    }
}

/// Successful result of a queued GATT operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Read(Vec<u8>),
    Written,
    NotifyState(bool),
}

/// Caller-facing events, delivered in order on a single channel.
///
/// Serializes to the flat `{kind, service_uuid?, characteristic_uuid?,
/// payload?, error_message?}` record expected by host bridges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    DataReceived {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        payload: Vec<u8>,
    },
    DataWritten {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        success: bool,
    },
    NotificationStateChanged {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        enabled: bool,
    },
    DeviceDiscovered {
        address: String,
        name: Option<String>,
        rssi: i16,
    },
    ScanStarted,
    ScanStopped,
    ConnectionStateChanged {
        address: Option<String>,
        state: ConnectionState,
    },
    ServicesDiscovered {
        service_count: usize,
        characteristic_count: usize,
    },
    Error {
        error_message: String,
    },
}

impl SessionEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_message: message.into(),
        }
    }
}
