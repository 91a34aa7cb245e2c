//! BLE Scanner Module
//!
//! Turns raw scan results into a deduplicated stream of discovered devices.

use crate::domain::models::{Device, SessionEvent};
use crate::error::{BleError, TransportError};
use crate::infrastructure::bluetooth::transport::Transport;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Scan Coordinator
///
/// The first sighting of an address is published; later sightings are
/// dropped so the device list stays stable.
pub struct ScanCoordinator {
    scanning: bool,
    devices: Vec<Device>,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ScanCoordinator {
    pub fn new(event_sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            scanning: false,
            devices: Vec::new(),
            event_sender,
        }
    }

    /// Start scanning. A no-op while a scan is already running.
    pub fn start(&mut self, transport: &mut dyn Transport) -> Result<(), BleError> {
        if self.scanning {
            debug!("Scan already running");
            return Ok(());
        }

        if !transport.is_radio_enabled() {
            warn!("Cannot start scan: radio is off");
            return Err(BleError::RadioUnavailable);
        }

        transport.start_scan().map_err(|e| match e {
            TransportError::RadioUnavailable => BleError::RadioUnavailable,
            other => other.into_rejection(),
        })?;

        info!("Starting BLE scan");
        self.devices.clear();
        self.scanning = true;
        let _ = self.event_sender.send(SessionEvent::ScanStarted);
        Ok(())
    }

    /// Stop scanning
    pub fn stop(&mut self, transport: &mut dyn Transport) {
        if !self.scanning {
            return;
        }

        info!("Stopping BLE scan...");
        if let Err(e) = transport.stop_scan() {
            warn!("Transport failed to stop scan: {}", e);
        }
        self.scanning = false;
        let _ = self.event_sender.send(SessionEvent::ScanStopped);
    }

    pub fn on_scan_result(&mut self, device: Device) {
        if !self.scanning {
            debug!("Ignoring scan result for {} after stop", device.address);
            return;
        }

        if self.devices.contains(&device) {
            return;
        }

        debug!("Device found: {} ({} dBm)", device.address, device.rssi);
        let _ = self.event_sender.send(SessionEvent::DeviceDiscovered {
            address: device.address.clone(),
            name: device.name.clone(),
            rssi: device.rssi,
        });
        self.devices.push(device);
    }

    /// Scan failures end the scan and are reported, never retried.
    pub fn on_scan_failed(&mut self, code: i32) {
        warn!("BLE scan failed with code {}", code);
        self.scanning = false;
        let _ = self
            .event_sender
            .send(SessionEvent::error(format!("Scan failed: {}", code)));
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn find(&self, address: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.address == address)
    }
}
