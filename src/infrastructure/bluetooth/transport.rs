//! Transport Adapter boundary
//!
//! The platform BLE stack sits behind [`Transport`]: every method submits a
//! request and returns immediately. Results come back later as
//! [`TransportEvent`]s pushed into a [`TransportSink`].

use crate::domain::models::{CharacteristicKey, Device, Service};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::service::SessionInput;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque handle for one physical link, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

/// Raw GATT status code reported by the stack. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure, matches the common `GATT_FAILURE` code
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

/// Fire-and-forget submission interface of the platform BLE stack.
pub trait Transport: Send + 'static {
    fn is_radio_enabled(&self) -> bool;

    fn start_scan(&mut self) -> Result<(), TransportError>;
    fn stop_scan(&mut self) -> Result<(), TransportError>;

    fn submit_connect(&mut self, device: &Device) -> Result<LinkHandle, TransportError>;
    /// Disconnect and release the link handle.
    fn submit_disconnect(&mut self, link: LinkHandle);
    fn submit_discover_services(&mut self, link: LinkHandle) -> Result<(), TransportError>;

    fn submit_read(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
    ) -> Result<(), TransportError>;
    fn submit_write(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
        value: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;
    /// Toggle local notification routing. Completes synchronously.
    fn submit_set_notify(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
        enabled: bool,
    ) -> Result<(), TransportError>;
    fn submit_descriptor_write(
        &mut self,
        link: LinkHandle,
        target: &CharacteristicKey,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;
}

/// Callbacks from the platform BLE stack.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionStateChanged {
        link: LinkHandle,
        connected: bool,
    },
    ServicesDiscovered {
        link: LinkHandle,
        result: Result<Vec<Service>, GattStatus>,
    },
    CharacteristicRead {
        link: LinkHandle,
        target: CharacteristicKey,
        result: Result<Vec<u8>, GattStatus>,
    },
    CharacteristicWrite {
        link: LinkHandle,
        target: CharacteristicKey,
        status: GattStatus,
    },
    /// Unsolicited value push from the peripheral
    CharacteristicChanged {
        link: LinkHandle,
        target: CharacteristicKey,
        value: Vec<u8>,
    },
    DescriptorWrite {
        link: LinkHandle,
        target: CharacteristicKey,
        descriptor: Uuid,
        status: GattStatus,
    },
    ScanResult {
        device: Device,
    },
    ScanFailed {
        code: i32,
    },
}

impl TransportEvent {
    /// The link this callback belongs to, if any.
    pub fn link(&self) -> Option<LinkHandle> {
        match self {
            Self::ConnectionStateChanged { link, .. }
            | Self::ServicesDiscovered { link, .. }
            | Self::CharacteristicRead { link, .. }
            | Self::CharacteristicWrite { link, .. }
            | Self::CharacteristicChanged { link, .. }
            | Self::DescriptorWrite { link, .. } => Some(*link),
            Self::ScanResult { .. } | Self::ScanFailed { .. } => None,
        }
    }
}

/// Clonable callback sink handed to the platform adapter.
///
/// Events share the session's input channel with caller commands, so both
/// are observed by the session in arrival order.
#[derive(Debug, Clone)]
pub struct TransportSink {
    input: mpsc::UnboundedSender<SessionInput>,
}

impl TransportSink {
    pub(crate) fn new(input: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { input }
    }

    /// Deliver a callback. Returns false once the session has shut down.
    pub fn deliver(&self, event: TransportEvent) -> bool {
        self.input.send(SessionInput::Transport(event)).is_ok()
    }
}
