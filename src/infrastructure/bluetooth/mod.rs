//! Bluetooth Module
//!
//! Central-role BLE session: discovery, one GATT link, and serialized
//! read/write/notify operations against it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       BleSession                        │
//! │   (clonable handle; commands + callbacks -> one actor)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌───────────────┐        ┌──────────────────────┐
//! │ScanCoordinator│        │ConnectionStateMachine│
//! │               │        │                      │
//! │ - dedup by    │        │ - lifecycle states   │
//! │   address     │        │ - TopologyCache      │
//! └───────┬───────┘        │ - OperationQueue     │
//!         │                └──────────┬───────────┘
//!         └────────────┬──────────────┘
//!                      ▼
//!              ┌───────────────┐
//!              │   Transport   │  platform BLE stack
//!              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Well-known uuids, descriptor values and uuid parsing
//! - [`transport`] - Transport Adapter boundary and its callback events
//! - [`scanner`] - Deduplicating scan coordinator
//! - [`queue`] - Single-in-flight GATT operation queue
//! - [`connection`] - Connection state machine
//! - [`service`] - Session facade and actor loop
//! - `mock` - In-memory transport for tests (`mock` feature)

pub mod connection;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod protocol;
pub mod queue;
pub mod scanner;
pub mod service;
pub mod transport;

pub use service::BleSession;
