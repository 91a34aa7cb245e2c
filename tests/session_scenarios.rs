//! End-to-end session scenarios driven through the in-memory transport.

use ble_session::infrastructure::bluetooth::mock::{MockTransport, Submission};
use ble_session::infrastructure::bluetooth::protocol::{self, uuid_from_short};
use ble_session::{
    BleError, BleSession, CharacteristicKey, CharacteristicProperties, ConnectionConfig,
    ConnectionState, Device, GattStatus, LinkHandle, Service, SessionEvent, TransportEvent,
    TransportSink,
};
use tokio::sync::mpsc;

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

struct Rig {
    session: BleSession,
    sink: TransportSink,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    submissions: mpsc::UnboundedReceiver<Submission>,
}

fn rig() -> Rig {
    let (transport, submissions) = MockTransport::new();
    let (session, events) = BleSession::spawn(transport, ConnectionConfig::default());
    Rig {
        sink: session.transport_sink(),
        session,
        events,
        submissions,
    }
}

fn key(service: u32, characteristic: u32) -> CharacteristicKey {
    CharacteristicKey::new(uuid_from_short(service), uuid_from_short(characteristic))
}

fn props(bits: u8) -> CharacteristicProperties {
    CharacteristicProperties::from_bits(bits)
}

impl Rig {
    async fn submission(&mut self) -> Submission {
        self.submissions.recv().await.expect("transport dropped")
    }

    /// Assert nothing else reached the transport so far.
    async fn assert_no_submission(&mut self) {
        // Round-trip through the actor so earlier commands are processed
        self.session.snapshot().await.unwrap();
        assert!(self.submissions.try_recv().is_err());
    }

    async fn connect_ready(&mut self, address: &str, services: Vec<Service>) -> LinkHandle {
        let connecting = tokio::spawn({
            let session = self.session.clone();
            let device = Device::new(address, None, -55);
            async move { session.connect(device).await }
        });

        let link = loop {
            if let Submission::Connect { link, .. } = self.submission().await {
                break link;
            }
        };
        self.sink.deliver(TransportEvent::ConnectionStateChanged {
            link,
            connected: true,
        });
        assert_eq!(
            self.submission().await,
            Submission::DiscoverServices { link }
        );
        self.sink.deliver(TransportEvent::ServicesDiscovered {
            link,
            result: Ok(services),
        });

        connecting.await.unwrap().unwrap();
        link
    }

    async fn wait_for_queue(&self, expected: usize) {
        loop {
            let snapshot = self.session.snapshot().await.unwrap();
            if snapshot.queued_operations == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

#[tokio::test]
async fn battery_read_delivers_exact_bytes() {
    let mut rig = rig();
    let battery = key(0x180F, 0x2A19);
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(battery.service)
                .with_characteristic(battery.characteristic, props(CharacteristicProperties::READ))],
        )
        .await;

    let reading = tokio::spawn({
        let session = rig.session.clone();
        async move { session.read("180F:2A19".parse().unwrap()).await }
    });
    assert_eq!(
        rig.submission().await,
        Submission::Read {
            link,
            target: battery
        }
    );
    rig.sink.deliver(TransportEvent::CharacteristicRead {
        link,
        target: battery,
        result: Ok(vec![0x5A]),
    });

    assert_eq!(reading.await.unwrap(), Ok(vec![0x5A]));
    let snapshot = rig.session.snapshot().await.unwrap();
    assert_eq!(snapshot.queued_operations, 0);

    let events = rig.drain_events();
    assert!(events.contains(&SessionEvent::DataReceived {
        service_uuid: battery.service,
        characteristic_uuid: battery.characteristic,
        payload: vec![0x5A],
    }));
}

#[tokio::test]
async fn operations_complete_in_submission_order_one_at_a_time() {
    let mut rig = rig();
    let targets = [key(0x180F, 0x2A19), key(0x180F, 0x2A1A), key(0x180F, 0x2A1B)];
    let mut service = Service::new(uuid_from_short(0x180F));
    for target in &targets {
        service = service.with_characteristic(
            target.characteristic,
            props(CharacteristicProperties::READ),
        );
    }
    let link = rig.connect_ready(ADDRESS, vec![service]).await;

    let mut tasks = Vec::new();
    for (i, target) in targets.iter().copied().enumerate() {
        let session = rig.session.clone();
        tasks.push(tokio::spawn(async move { session.read(target).await }));
        rig.wait_for_queue(i + 1).await;
    }

    for (i, target) in targets.iter().copied().enumerate() {
        // Exactly one read is outstanding, and it is the oldest
        assert_eq!(rig.submission().await, Submission::Read { link, target });
        rig.assert_no_submission().await;

        rig.sink.deliver(TransportEvent::CharacteristicRead {
            link,
            target,
            result: Ok(vec![i as u8]),
        });
    }

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), Ok(vec![i as u8]));
    }

    let payloads: Vec<Vec<u8>> = rig
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::DataReceived { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
}

#[tokio::test(start_paused = true)]
async fn late_reply_to_timed_out_read_does_not_resolve_the_next_one() {
    let mut rig = rig();
    let battery = key(0x180F, 0x2A19);
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(battery.service)
                .with_characteristic(battery.characteristic, props(CharacteristicProperties::READ))],
        )
        .await;

    let first = tokio::spawn({
        let session = rig.session.clone();
        async move { session.read(battery).await }
    });
    rig.wait_for_queue(1).await;
    let second = tokio::spawn({
        let session = rig.session.clone();
        async move { session.read(battery).await }
    });
    rig.wait_for_queue(2).await;
    assert_eq!(
        rig.submission().await,
        Submission::Read {
            link,
            target: battery
        }
    );

    assert_eq!(first.await.unwrap(), Err(BleError::Timeout));
    // The first read is still outstanding at the radio
    rig.assert_no_submission().await;

    rig.sink.deliver(TransportEvent::CharacteristicRead {
        link,
        target: battery,
        result: Ok(vec![0xEE]),
    });
    assert_eq!(
        rig.submission().await,
        Submission::Read {
            link,
            target: battery
        }
    );
    rig.sink.deliver(TransportEvent::CharacteristicRead {
        link,
        target: battery,
        result: Ok(vec![0x5A]),
    });

    assert_eq!(second.await.unwrap(), Ok(vec![0x5A]));
    assert_eq!(rig.session.state().await, Ok(ConnectionState::Ready));
}

#[tokio::test]
async fn disconnect_fails_queued_operations_and_clears_cache() {
    let mut rig = rig();
    let battery = key(0x180F, 0x2A19);
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(battery.service)
                .with_characteristic(battery.characteristic, props(CharacteristicProperties::READ))],
        )
        .await;

    let mut tasks = Vec::new();
    for i in 0..3 {
        let session = rig.session.clone();
        tasks.push(tokio::spawn(async move { session.read(battery).await }));
        rig.wait_for_queue(i + 1).await;
    }

    rig.session.disconnect().await.unwrap();
    for task in tasks {
        assert_eq!(task.await.unwrap(), Err(BleError::ConnectionLost));
    }

    let snapshot = rig.session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.services.is_empty());
    assert_eq!(snapshot.queued_operations, 0);
    assert_eq!(rig.session.read(battery).await, Err(BleError::NotReady));

    let released: Vec<_> = std::iter::from_fn(|| rig.submissions.try_recv().ok())
        .filter(|s| matches!(s, Submission::Disconnect { .. }))
        .collect();
    assert_eq!(released, vec![Submission::Disconnect { link }]);

    // Idempotent
    rig.session.disconnect().await.unwrap();
    rig.assert_no_submission().await;
}

#[tokio::test]
async fn peripheral_disconnect_fails_in_flight_operation() {
    let mut rig = rig();
    let battery = key(0x180F, 0x2A19);
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(battery.service)
                .with_characteristic(battery.characteristic, props(CharacteristicProperties::READ))],
        )
        .await;

    let reading = tokio::spawn({
        let session = rig.session.clone();
        async move { session.read(battery).await }
    });
    assert!(matches!(rig.submission().await, Submission::Read { .. }));

    rig.sink.deliver(TransportEvent::ConnectionStateChanged {
        link,
        connected: false,
    });
    assert_eq!(reading.await.unwrap(), Err(BleError::ConnectionLost));
    assert_eq!(
        rig.session.state().await,
        Ok(ConnectionState::Disconnected)
    );
    assert!(rig
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Error { .. })));
}

#[tokio::test]
async fn nothing_is_dispatched_before_discovery_completes() {
    let mut rig = rig();
    let battery = key(0x180F, 0x2A19);

    let connecting = tokio::spawn({
        let session = rig.session.clone();
        async move { session.connect(Device::new(ADDRESS, None, -40)).await }
    });
    let Submission::Connect { link, .. } = rig.submission().await else {
        panic!("expected connect");
    };
    assert_eq!(rig.session.read(battery).await, Err(BleError::NotReady));

    rig.sink.deliver(TransportEvent::ConnectionStateChanged {
        link,
        connected: true,
    });
    assert_eq!(rig.submission().await, Submission::DiscoverServices { link });
    assert_eq!(rig.session.read(battery).await, Err(BleError::NotReady));
    rig.assert_no_submission().await;

    rig.sink.deliver(TransportEvent::ServicesDiscovered {
        link,
        result: Ok(vec![Service::new(battery.service)
            .with_characteristic(battery.characteristic, props(CharacteristicProperties::READ))]),
    });
    connecting.await.unwrap().unwrap();

    let states: Vec<ConnectionState> = rig
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::ConnectionStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::DiscoveringServices,
            ConnectionState::Ready,
        ]
    );
}

#[tokio::test]
async fn write_to_notify_only_characteristic_is_unsupported() {
    let mut rig = rig();
    let target = key(0x180D, 0x2A37);
    rig.connect_ready(
        ADDRESS,
        vec![Service::new(target.service)
            .with_characteristic(target.characteristic, props(CharacteristicProperties::NOTIFY))],
    )
    .await;

    let result = rig.session.write(target, vec![0x01]).await;
    assert!(matches!(
        result,
        Err(BleError::UnsupportedCapability { .. })
    ));
    rig.assert_no_submission().await;
}

#[tokio::test]
async fn notification_reaches_subscriber_without_using_the_queue() {
    let mut rig = rig();
    let target = key(0x180D, 0x2A37);
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(target.service)
                .with_characteristic(target.characteristic, props(CharacteristicProperties::NOTIFY))],
        )
        .await;

    let enabling = tokio::spawn({
        let session = rig.session.clone();
        async move { session.set_notify(target, true).await }
    });
    assert_eq!(
        rig.submission().await,
        Submission::SetNotify {
            link,
            target,
            enabled: true
        }
    );
    assert_eq!(
        rig.submission().await,
        Submission::DescriptorWrite {
            link,
            target,
            descriptor: protocol::cccd_uuid(),
            value: protocol::ENABLE_NOTIFICATION_VALUE.to_vec(),
        }
    );
    rig.sink.deliver(TransportEvent::DescriptorWrite {
        link,
        target,
        descriptor: protocol::cccd_uuid(),
        status: GattStatus::SUCCESS,
    });
    enabling.await.unwrap().unwrap();

    let mut values = rig.session.subscribe(target).await.unwrap();
    rig.sink.deliver(TransportEvent::CharacteristicChanged {
        link,
        target,
        value: vec![0x06, 0x48],
    });

    assert_eq!(values.recv().await, Some(vec![0x06, 0x48]));
    assert_eq!(rig.session.snapshot().await.unwrap().queued_operations, 0);
    rig.assert_no_submission().await;

    let events = rig.drain_events();
    assert!(events.contains(&SessionEvent::NotificationStateChanged {
        service_uuid: target.service,
        characteristic_uuid: target.characteristic,
        enabled: true,
    }));

    // Subscribers are released with the link
    rig.session.disconnect().await.unwrap();
    assert_eq!(values.recv().await, None);
}

#[tokio::test]
async fn second_connect_tears_down_first_attempt() {
    let mut rig = rig();

    let first = tokio::spawn({
        let session = rig.session.clone();
        async move { session.connect(Device::new("AA:AA:AA:AA:AA:01", None, -40)).await }
    });
    let Submission::Connect { link: first_link, .. } = rig.submission().await else {
        panic!("expected first connect");
    };

    let _second = tokio::spawn({
        let session = rig.session.clone();
        async move { session.connect(Device::new("AA:AA:AA:AA:AA:02", None, -40)).await }
    });

    assert_eq!(first.await.unwrap(), Err(BleError::ConnectionLost));
    assert_eq!(
        rig.submission().await,
        Submission::Disconnect { link: first_link }
    );
    let Submission::Connect { address, link } = rig.submission().await else {
        panic!("expected second connect");
    };
    assert_eq!(address, "AA:AA:AA:AA:AA:02");
    assert_ne!(link, first_link);

    // Late callback for the abandoned link changes nothing
    rig.sink.deliver(TransportEvent::ConnectionStateChanged {
        link: first_link,
        connected: true,
    });
    let snapshot = rig.session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connecting);
    assert_eq!(snapshot.device.unwrap().address, "AA:AA:AA:AA:AA:02");
}

#[tokio::test]
async fn connect_with_radio_off_is_rejected() {
    let (transport, _submissions) = MockTransport::new();
    transport.set_radio_enabled(false);
    let (session, _events) = BleSession::spawn(transport, ConnectionConfig::default());

    let result = session.connect(Device::new(ADDRESS, None, -40)).await;
    assert!(matches!(result, Err(BleError::TransportRejected(_))));
    assert_eq!(session.start_scan().await, Err(BleError::RadioUnavailable));
    assert_eq!(session.state().await, Ok(ConnectionState::Disconnected));
}

#[tokio::test]
async fn scan_reports_each_address_once() {
    let mut rig = rig();
    rig.session.start_scan().await.unwrap();
    assert_eq!(rig.submission().await, Submission::StartScan);

    for (address, rssi) in [(ADDRESS, -70), (ADDRESS, -50), ("11:22:33:44:55:66", -80)] {
        rig.sink.deliver(TransportEvent::ScanResult {
            device: Device::new(address, Some("Sensor".to_string()), rssi),
        });
    }
    rig.session.stop_scan().await.unwrap();

    let events = rig.drain_events();
    let discovered: Vec<&SessionEvent> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::DeviceDiscovered { .. }))
        .collect();
    assert_eq!(discovered.len(), 2);
    assert_eq!(events.first(), Some(&SessionEvent::ScanStarted));
    assert_eq!(events.last(), Some(&SessionEvent::ScanStopped));

    let devices = rig.session.discovered_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(
        rig.session.find_device(ADDRESS).await.unwrap().unwrap().rssi,
        -70
    );
}

#[tokio::test]
async fn failed_write_is_reported_with_status() {
    let mut rig = rig();
    let target = key(0xFFE0, 0xFFE1);
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(target.service).with_characteristic(
                target.characteristic,
                props(CharacteristicProperties::WRITE_WITHOUT_RESPONSE),
            )],
        )
        .await;

    let writing = tokio::spawn({
        let session = rig.session.clone();
        async move { session.write(target, [0x01, 0x02]).await }
    });
    assert_eq!(
        rig.submission().await,
        Submission::Write {
            link,
            target,
            value: vec![0x01, 0x02],
            with_response: false,
        }
    );
    rig.sink.deliver(TransportEvent::CharacteristicWrite {
        link,
        target,
        status: GattStatus(0x03),
    });

    assert_eq!(writing.await.unwrap(), Err(BleError::Gatt { status: 3 }));
    assert!(rig.drain_events().contains(&SessionEvent::DataWritten {
        service_uuid: target.service,
        characteristic_uuid: target.characteristic,
        success: false,
    }));
}

#[tokio::test]
async fn well_known_reads_use_standard_uuids() {
    let mut rig = rig();
    let name = protocol::manufacturer_name_key();
    let link = rig
        .connect_ready(
            ADDRESS,
            vec![Service::new(name.service)
                .with_characteristic(name.characteristic, props(CharacteristicProperties::READ))],
        )
        .await;

    let reading = tokio::spawn({
        let session = rig.session.clone();
        async move { session.read_manufacturer_name().await }
    });
    assert_eq!(
        rig.submission().await,
        Submission::Read { link, target: name }
    );
    rig.sink.deliver(TransportEvent::CharacteristicRead {
        link,
        target: name,
        result: Ok(b"Nordic".to_vec()),
    });
    assert_eq!(reading.await.unwrap(), Ok("Nordic".to_string()));

    // Battery service is absent on this peripheral
    assert_eq!(
        rig.session.read_battery_level().await,
        Err(BleError::CharacteristicNotFound(protocol::battery_level_key()))
    );
    let characteristics = rig.session.characteristics(name.service).await.unwrap();
    assert_eq!(characteristics.len(), 1);
}
