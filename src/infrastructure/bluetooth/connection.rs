//! BLE Connection Module
//!
//! Connection State Machine for one physical link. It owns the link handle,
//! the Topology Cache and the Operation Queue, and is the only thing that
//! mutates them.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::models::{
    CharacteristicKey, ConnectionState, Device, OperationKind, OperationOutcome, Service,
    SessionEvent,
};
use crate::domain::topology::TopologyCache;
use crate::error::BleError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::queue::{
    Completion, Expired, Matched, OperationQueue, OperationReply, OperationRequest,
    PendingOperation,
};
use crate::infrastructure::bluetooth::transport::{GattStatus, LinkHandle, Transport, TransportEvent};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on `Connecting` before the attempt is abandoned
    pub connect_timeout: Duration,
    /// Bound on `DiscoveringServices`
    pub discovery_timeout: Duration,
    /// Bound on each in-flight GATT operation
    pub operation_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

pub type ConnectReply = oneshot::Sender<Result<(), BleError>>;

/// A caller's GATT request before it is checked against the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    Read,
    Write(Vec<u8>),
    SetNotify(bool),
}

impl GattRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Read => OperationKind::Read,
            Self::Write(_) => OperationKind::Write,
            Self::SetNotify(_) => OperationKind::SetNotify,
        }
    }
}

pub struct ConnectionStateMachine {
    config: ConnectionConfig,
    state: ConnectionState,
    device: Option<Device>,
    link: Option<LinkHandle>,
    /// Deadline for the current connect or discovery phase
    deadline: Option<Instant>,
    topology: TopologyCache,
    queue: OperationQueue,
    connect_waiters: Vec<ConnectReply>,
    subscribers: HashMap<CharacteristicKey, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    next_operation_id: u64,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionStateMachine {
    pub fn new(config: ConnectionConfig, event_sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            device: None,
            link: None,
            deadline: None,
            topology: TopologyCache::new(),
            queue: OperationQueue::new(),
            connect_waiters: Vec::new(),
            subscribers: HashMap::new(),
            next_operation_id: 1,
            event_sender,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn topology(&self) -> &TopologyCache {
        &self.topology
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Earliest pending deadline across the connection phase and the queue.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.deadline, self.queue.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Connect to a device
    ///
    /// The reply resolves once the link is `Ready` or the attempt fails.
    pub fn connect(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
        device: Device,
        reply: ConnectReply,
    ) {
        if self.state != ConnectionState::Disconnected && self.device.as_ref() == Some(&device) {
            if self.state == ConnectionState::Ready {
                debug!("Already connected to {}", device.address);
                let _ = reply.send(Ok(()));
            } else {
                debug!("Connection to {} already in progress", device.address);
                self.connect_waiters.push(reply);
            }
            return;
        }

        if self.state != ConnectionState::Disconnected {
            info!(
                "Switching connection from {:?} to {}",
                self.device.as_ref().map(|d| d.address.as_str()),
                device.address
            );
            self.teardown(transport, BleError::ConnectionLost);
        }

        info!("Connecting to Bluetooth device: {}", device.address);
        match transport.submit_connect(&device) {
            Ok(link) => {
                self.link = Some(link);
                self.device = Some(device);
                self.deadline = Some(now + self.config.connect_timeout);
                self.connect_waiters.push(reply);
                self.set_state(ConnectionState::Connecting);
            }
            Err(e) => {
                warn!("Transport refused connect to {}: {}", device.address, e);
                let _ = reply.send(Err(e.into_rejection()));
            }
        }
    }

    /// Drive the machine to `Disconnected`. Safe to call in any state.
    pub fn disconnect(&mut self, transport: &mut dyn Transport) {
        if self.state != ConnectionState::Disconnected {
            info!("Disconnecting from device");
        }
        self.teardown(transport, BleError::ConnectionLost);
    }

    /// Validate a request against the topology and queue it.
    pub fn enqueue(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
        target: CharacteristicKey,
        request: GattRequest,
        reply: OperationReply,
    ) {
        match self.prepare(target, request) {
            Ok(request) => {
                let id = self.next_operation_id;
                self.next_operation_id += 1;
                self.queue
                    .push(PendingOperation::new(id, target, request, reply));
                self.pump(transport, now);
            }
            Err(e) => {
                debug!("Rejected request on {}: {}", target, e);
                let _ = reply.send(Err(e));
            }
        }
    }

    fn prepare(
        &self,
        target: CharacteristicKey,
        request: GattRequest,
    ) -> Result<OperationRequest, BleError> {
        if self.state != ConnectionState::Ready {
            return Err(BleError::NotReady);
        }

        let characteristic = self
            .topology
            .characteristic(&target)
            .ok_or(BleError::CharacteristicNotFound(target))?;
        let props = characteristic.properties;

        let kind = request.kind();
        if !props.supports(kind) {
            return Err(BleError::UnsupportedCapability {
                target,
                required: kind,
            });
        }

        Ok(match request {
            GattRequest::Read => OperationRequest::Read,
            GattRequest::Write(value) => OperationRequest::Write {
                value,
                with_response: props.write,
            },
            GattRequest::SetNotify(enabled) => {
                let descriptor_value = if !enabled {
                    protocol::DISABLE_NOTIFICATION_VALUE
                } else if props.notify {
                    protocol::ENABLE_NOTIFICATION_VALUE
                } else {
                    protocol::ENABLE_INDICATION_VALUE
                };
                OperationRequest::SetNotify {
                    enabled,
                    descriptor_value,
                }
            }
        })
    }

    /// Register a standing subscriber for unsolicited value pushes.
    ///
    /// Subscribers are dropped when the link goes down, which closes the
    /// receiver.
    pub fn subscribe(&mut self, key: CharacteristicKey) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(key).or_default().push(tx);
        rx
    }

    /// Feed a link-scoped transport callback into the machine.
    pub fn handle_event(&mut self, transport: &mut dyn Transport, now: Instant, event: TransportEvent) {
        if let Some(link) = event.link() {
            if self.link != Some(link) {
                warn!("Dropping stale callback for {:?}: {:?}", link, event);
                return;
            }
        }

        match event {
            TransportEvent::ConnectionStateChanged { connected: true, .. } => {
                self.on_connected(transport, now)
            }
            TransportEvent::ConnectionStateChanged { connected: false, .. } => {
                warn!("Link dropped by transport");
                if self.state == ConnectionState::Ready {
                    self.emit(SessionEvent::error("Connection lost"));
                }
                self.teardown(transport, BleError::ConnectionLost);
            }
            TransportEvent::ServicesDiscovered { result, .. } => {
                self.on_services_discovered(transport, now, result)
            }
            TransportEvent::CharacteristicRead { target, result, .. } => {
                let outcome = result
                    .map(OperationOutcome::Read)
                    .map_err(|status| BleError::Gatt { status: status.0 });
                self.on_completion(transport, now, Completion::Read(target), outcome);
            }
            TransportEvent::CharacteristicWrite { target, status, .. } => {
                let outcome = status_outcome(status, OperationOutcome::Written);
                self.on_completion(transport, now, Completion::Write(target), outcome);
            }
            TransportEvent::DescriptorWrite {
                target,
                descriptor,
                status,
                ..
            } => {
                let enabled = match self.queue.in_flight().map(|op| &op.request) {
                    Some(OperationRequest::SetNotify { enabled, .. }) => *enabled,
                    _ => false,
                };
                let outcome = status_outcome(status, OperationOutcome::NotifyState(enabled));
                self.on_completion(
                    transport,
                    now,
                    Completion::Descriptor(target, descriptor),
                    outcome,
                );
            }
            TransportEvent::CharacteristicChanged { target, value, .. } => {
                self.on_value_changed(target, value)
            }
            TransportEvent::ScanResult { .. } | TransportEvent::ScanFailed { .. } => {}
        }
    }

    /// Expire whatever deadline has passed by `now`.
    pub fn expire(&mut self, transport: &mut dyn Transport, now: Instant) {
        if self.deadline.is_some_and(|d| d <= now) {
            let message = match self.state {
                ConnectionState::DiscoveringServices => {
                    BleError::DiscoveryFailed("timed out".to_string()).to_string()
                }
                _ => "Connection attempt timed out".to_string(),
            };
            error!("{}", message);
            self.emit(SessionEvent::error(message));
            self.teardown(transport, BleError::Timeout);
        }

        match self.queue.expire(now, self.config.operation_timeout) {
            Expired::Nothing => {}
            Expired::Operation(op) => {
                // Nothing else is submitted until the radio answers or stalls
                warn!("{} {} timed out (#{})", op.kind(), op.target, op.id);
                self.finish(op, Err(BleError::Timeout));
            }
            Expired::Stalled => {
                error!("Transport never answered a timed-out operation, dropping link");
                self.emit(SessionEvent::error("Transport stopped responding"));
                self.teardown(transport, BleError::ConnectionLost);
            }
        }
    }

    fn on_connected(&mut self, transport: &mut dyn Transport, now: Instant) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connected callback in {:?}", self.state);
            return;
        }
        info!("Device connected, discovering services");
        self.set_state(ConnectionState::Connected);

        let Some(link) = self.link else {
            return;
        };
        match transport.submit_discover_services(link) {
            Ok(()) => {
                self.deadline = Some(now + self.config.discovery_timeout);
                self.set_state(ConnectionState::DiscoveringServices);
            }
            Err(e) => {
                let err = BleError::DiscoveryFailed(e.to_string());
                error!("{}", err);
                self.emit(SessionEvent::error(err.to_string()));
                self.teardown(transport, err);
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
        result: Result<Vec<Service>, GattStatus>,
    ) {
        if self.state != ConnectionState::DiscoveringServices {
            warn!("Ignoring discovery result in {:?}", self.state);
            return;
        }

        match result {
            Ok(services) => {
                self.topology.replace(services);
                self.deadline = None;
                info!(
                    "Found {} services, {} characteristics",
                    self.topology.services().len(),
                    self.topology.characteristic_count()
                );
                self.emit(SessionEvent::ServicesDiscovered {
                    service_count: self.topology.services().len(),
                    characteristic_count: self.topology.characteristic_count(),
                });
                self.set_state(ConnectionState::Ready);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.pump(transport, now);
            }
            Err(status) => {
                let err = BleError::DiscoveryFailed(format!("status {}", status.0));
                error!("{}", err);
                self.emit(SessionEvent::error(err.to_string()));
                self.teardown(transport, err);
            }
        }
    }

    fn on_completion(
        &mut self,
        transport: &mut dyn Transport,
        now: Instant,
        completion: Completion,
        outcome: Result<OperationOutcome, BleError>,
    ) {
        match self.queue.complete(completion) {
            Matched::Operation(op) => {
                self.finish(op, outcome);
                self.pump(transport, now);
            }
            Matched::Abandoned => {
                debug!("Discarded late completion {:?}", completion);
                self.pump(transport, now);
            }
            Matched::Unmatched => {
                warn!("Completion {:?} matches no in-flight operation", completion)
            }
        }
    }

    fn on_value_changed(&mut self, target: CharacteristicKey, value: Vec<u8>) {
        debug!("Notification on {}: {:02X?}", target, value);
        self.topology.record_value(&target, &value);

        if let Some(subs) = self.subscribers.get_mut(&target) {
            subs.retain(|tx| tx.send(value.clone()).is_ok());
        }
        self.emit(SessionEvent::DataReceived {
            service_uuid: target.service,
            characteristic_uuid: target.characteristic,
            payload: value,
        });
    }

    /// Submit queued work while the link is serviceable.
    fn pump(&mut self, transport: &mut dyn Transport, now: Instant) {
        if self.state != ConnectionState::Ready {
            return;
        }
        let Some(link) = self.link else {
            return;
        };
        let refused = self
            .queue
            .pump(transport, link, now, self.config.operation_timeout);
        for (op, err) in refused {
            warn!("Transport refused {} {}: {}", op.kind(), op.target, err);
            self.finish(op, Err(err));
        }
    }

    /// Publish the outcome of an operation and resolve its caller.
    fn finish(&mut self, op: PendingOperation, outcome: Result<OperationOutcome, BleError>) {
        let target = op.target;
        match &outcome {
            Ok(OperationOutcome::Read(value)) => {
                self.topology.record_value(&target, value);
                self.emit(SessionEvent::DataReceived {
                    service_uuid: target.service,
                    characteristic_uuid: target.characteristic,
                    payload: value.clone(),
                });
            }
            Ok(OperationOutcome::Written) => self.emit(SessionEvent::DataWritten {
                service_uuid: target.service,
                characteristic_uuid: target.characteristic,
                success: true,
            }),
            Ok(OperationOutcome::NotifyState(enabled)) => {
                self.emit(SessionEvent::NotificationStateChanged {
                    service_uuid: target.service,
                    characteristic_uuid: target.characteristic,
                    enabled: *enabled,
                })
            }
            Err(e) => {
                warn!("{} {} failed: {}", op.kind(), target, e);
                if op.kind() == OperationKind::Write {
                    self.emit(SessionEvent::DataWritten {
                        service_uuid: target.service,
                        characteristic_uuid: target.characteristic,
                        success: false,
                    });
                }
            }
        }
        op.resolve(outcome);
    }

    /// Single path into `Disconnected`: drain the queue, fail connect
    /// waiters, release the link once and clear the cache.
    fn teardown(&mut self, transport: &mut dyn Transport, reason: BleError) {
        for op in self.queue.drain() {
            op.resolve(Err(BleError::ConnectionLost));
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
        if let Some(link) = self.link.take() {
            transport.submit_disconnect(link);
        }
        self.topology.clear();
        self.subscribers.clear();
        self.deadline = None;

        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.device = None;
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("Connection state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::ConnectionStateChanged {
            address: self.device.as_ref().map(|d| d.address.clone()),
            state,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }
}

fn status_outcome(
    status: GattStatus,
    success: OperationOutcome,
) -> Result<OperationOutcome, BleError> {
    if status.is_success() {
        Ok(success)
    } else {
        Err(BleError::Gatt { status: status.0 })
    }
}
