//! Bluetooth Service Module
//!
//! Session Facade over the scanner and the connection state machine. All
//! state lives in one actor task; caller commands and transport callbacks
//! reach it over the same channel, so they are handled strictly one at a
//! time and in arrival order.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    Characteristic, CharacteristicKey, ConnectionState, Device, OperationOutcome, Service,
    SessionEvent,
};
use crate::domain::settings::SessionSettings;
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::connection::{
    ConnectReply, ConnectionConfig, ConnectionStateMachine, GattRequest,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::queue::OperationReply;
use crate::infrastructure::bluetooth::scanner::ScanCoordinator;
use crate::infrastructure::bluetooth::transport::{
    GattStatus, Transport, TransportEvent, TransportSink,
};

/// Everything the session actor consumes.
#[derive(Debug)]
pub(crate) enum SessionInput {
    Command(Command),
    Transport(TransportEvent),
}

#[derive(Debug)]
pub(crate) enum Command {
    StartScan(oneshot::Sender<Result<()>>),
    StopScan(oneshot::Sender<()>),
    Connect(Device, ConnectReply),
    Disconnect(oneshot::Sender<()>),
    Gatt {
        target: CharacteristicKey,
        request: GattRequest,
        reply: OperationReply,
    },
    Subscribe(CharacteristicKey, oneshot::Sender<mpsc::UnboundedReceiver<Vec<u8>>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time copy of the session's observable state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub device: Option<Device>,
    pub services: Vec<Service>,
    pub queued_operations: usize,
    pub scanning: bool,
    pub discovered_devices: Vec<Device>,
}

/// State owned by the actor task.
struct SessionCore {
    transport: Box<dyn Transport>,
    scanner: ScanCoordinator,
    connection: ConnectionStateMachine,
}

impl SessionCore {
    /// Handle one input. Returns false once the session should stop.
    fn handle(&mut self, input: SessionInput, now: Instant) -> bool {
        let transport = self.transport.as_mut();
        match input {
            SessionInput::Transport(TransportEvent::ScanResult { device }) => {
                self.scanner.on_scan_result(device)
            }
            SessionInput::Transport(TransportEvent::ScanFailed { code }) => {
                self.scanner.on_scan_failed(code)
            }
            SessionInput::Transport(event) => self.connection.handle_event(transport, now, event),
            SessionInput::Command(command) => match command {
                Command::StartScan(reply) => {
                    let _ = reply.send(self.scanner.start(transport));
                }
                Command::StopScan(reply) => {
                    self.scanner.stop(transport);
                    let _ = reply.send(());
                }
                Command::Connect(device, reply) => {
                    self.connection.connect(transport, now, device, reply)
                }
                Command::Disconnect(reply) => {
                    self.connection.disconnect(transport);
                    let _ = reply.send(());
                }
                Command::Gatt {
                    target,
                    request,
                    reply,
                } => self.connection.enqueue(transport, now, target, request, reply),
                Command::Subscribe(key, reply) => {
                    let _ = reply.send(self.connection.subscribe(key));
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown(reply) => {
                    self.stop();
                    let _ = reply.send(());
                    return false;
                }
            },
        }
        true
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.connection.state(),
            device: self.connection.device().cloned(),
            services: self.connection.topology().services().to_vec(),
            queued_operations: self.connection.queue_len(),
            scanning: self.scanner.is_scanning(),
            discovered_devices: self.scanner.devices().to_vec(),
        }
    }

    fn stop(&mut self) {
        let transport = self.transport.as_mut();
        self.scanner.stop(transport);
        self.connection.disconnect(transport);
    }
}

async fn run(mut core: SessionCore, mut input: mpsc::UnboundedReceiver<SessionInput>) {
    info!("BLE session started");
    loop {
        let deadline = core.connection.next_deadline();
        tokio::select! {
            next = input.recv() => {
                let Some(next) = next else {
                    core.stop();
                    break;
                };
                if !core.handle(next, Instant::now()) {
                    break;
                }
            }
            _ = wait_until(deadline) => {
                core.connection.expire(core.transport.as_mut(), Instant::now());
            }
        }
    }
    info!("BLE session stopped");
}

fn wait_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Main BLE session handle
///
/// Cheap to clone; every clone talks to the same actor. Each request returns
/// a future that resolves to exactly one outcome.
#[derive(Debug, Clone)]
pub struct BleSession {
    input: mpsc::UnboundedSender<SessionInput>,
}

impl BleSession {
    /// Start the session actor on the current Tokio runtime.
    ///
    /// Returns the handle and the ordered caller-facing event stream.
    pub fn spawn<T: Transport>(
        transport: T,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let core = SessionCore {
            transport: Box::new(transport),
            scanner: ScanCoordinator::new(event_tx.clone()),
            connection: ConnectionStateMachine::new(config, event_tx),
        };
        tokio::spawn(run(core, input_rx));

        (Self { input: input_tx }, event_rx)
    }

    /// Start a session with timeouts taken from persisted settings.
    pub fn with_settings<T: Transport>(
        transport: T,
        settings: &SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::spawn(transport, settings.connection_config())
    }

    /// Sink through which the platform adapter delivers its callbacks.
    pub fn transport_sink(&self) -> TransportSink {
        TransportSink::new(self.input.clone())
    }

    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.input
            .send(SessionInput::Command(command(tx)))
            .map_err(|_| BleError::SessionClosed)?;
        rx.await.map_err(|_| BleError::SessionClosed)
    }

    async fn gatt(&self, target: CharacteristicKey, request: GattRequest) -> Result<OperationOutcome> {
        debug!("Requesting {} on {}", request.kind(), target);
        self.request(|reply| Command::Gatt {
            target,
            request,
            reply,
        })
        .await?
    }

    pub async fn start_scan(&self) -> Result<()> {
        self.request(Command::StartScan).await?
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Command::StopScan).await
    }

    /// Connect and wait until services are discovered.
    pub async fn connect(&self, device: Device) -> Result<()> {
        self.request(|reply| Command::Connect(device, reply)).await?
    }

    /// Connect to a device from the current scan results.
    pub async fn connect_address(&self, address: &str) -> Result<()> {
        let device = self
            .find_device(address)
            .await?
            .ok_or_else(|| BleError::DeviceNotFound(address.to_string()))?;
        self.connect(device).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Services in the topology cache of the current connection.
    pub async fn discover_services(&self) -> Result<Vec<Service>> {
        Ok(self.snapshot().await?.services)
    }

    /// Characteristics of one cached service, empty if it is unknown.
    pub async fn characteristics(&self, service_uuid: Uuid) -> Result<Vec<Characteristic>> {
        Ok(self
            .discover_services()
            .await?
            .into_iter()
            .find(|s| s.uuid == service_uuid)
            .map(|s| s.characteristics)
            .unwrap_or_default())
    }

    pub async fn read(&self, target: CharacteristicKey) -> Result<Vec<u8>> {
        let OperationOutcome::Read(value) = self.gatt(target, GattRequest::Read).await? else {
            warn!("Read of {} resolved without a value", target);
            return Err(BleError::Gatt {
                status: GattStatus::FAILURE.0,
            });
        };
        Ok(value)
    }

    pub async fn write(&self, target: CharacteristicKey, value: impl Into<Vec<u8>>) -> Result<()> {
        self.gatt(target, GattRequest::Write(value.into()))
            .await
            .map(|_| ())
    }

    pub async fn set_notify(&self, target: CharacteristicKey, enabled: bool) -> Result<()> {
        self.gatt(target, GattRequest::SetNotify(enabled))
            .await
            .map(|_| ())
    }

    /// Receive unsolicited value pushes for one characteristic.
    ///
    /// The receiver closes when the connection goes down.
    pub async fn subscribe(
        &self,
        target: CharacteristicKey,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.request(|reply| Command::Subscribe(target, reply)).await
    }

    /// Battery Level (0x2A19) of the Battery Service
    pub async fn read_battery_level(&self) -> Result<Vec<u8>> {
        self.read(protocol::battery_level_key()).await
    }

    /// Manufacturer Name String (0x2A29) of the Device Information Service
    pub async fn read_manufacturer_name(&self) -> Result<String> {
        let raw = self.read(protocol::manufacturer_name_key()).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn is_connected(&self) -> Result<bool> {
        Ok(self.state().await? == ConnectionState::Ready)
    }

    pub async fn connected_device(&self) -> Result<Option<Device>> {
        Ok(self.snapshot().await?.device)
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        Ok(self.snapshot().await?.scanning)
    }

    pub async fn discovered_devices(&self) -> Result<Vec<Device>> {
        Ok(self.snapshot().await?.discovered_devices)
    }

    pub async fn find_device(&self, address: &str) -> Result<Option<Device>> {
        Ok(self
            .discovered_devices()
            .await?
            .into_iter()
            .find(|d| d.address == address))
    }

    /// Stop scanning, disconnect and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}
