//! Central-role Bluetooth Low Energy session manager.
//!
//! Discovers peripherals, holds one GATT connection, caches its services
//! and runs read/write/notify requests through a queue that keeps exactly
//! one operation outstanding on the link. Platform stacks plug in through
//! [`Transport`] and report back through a [`TransportSink`].
//!
//! ```no_run
//! use ble_session::{BleSession, CharacteristicKey, ConnectionConfig, Device};
//! # async fn demo(transport: impl ble_session::Transport) -> Result<(), ble_session::BleError> {
//! let (session, mut events) = BleSession::spawn(transport, ConnectionConfig::default());
//! session.connect(Device::new("AA:BB:CC:DD:EE:FF", None, -60)).await?;
//! let level = session.read("180F:2A19".parse::<CharacteristicKey>()?).await?;
//! # let _ = (level, events.recv().await);
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    Characteristic, CharacteristicKey, CharacteristicProperties, ConnectionState, Device,
    OperationKind, OperationOutcome, Service, SessionEvent,
};
pub use domain::settings::{LogSettings, SessionSettings, SettingsService};
pub use error::{BleError, TransportError};
pub use infrastructure::bluetooth::connection::ConnectionConfig;
pub use infrastructure::bluetooth::service::{BleSession, SessionSnapshot};
pub use infrastructure::bluetooth::transport::{
    GattStatus, LinkHandle, Transport, TransportEvent, TransportSink,
};
pub use infrastructure::logging::{init_logger, LoggingGuard};
