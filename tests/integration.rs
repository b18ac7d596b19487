//! End-to-end tests driving the coordinator against a scripted radio driver.
//!
//! `FakeDriver` answers requests by pushing events onto the driver channel,
//! optionally after a delay; the tests run on paused tokio time so every
//! timing assertion is deterministic.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use ble_central::{
    event_channel, Advertisement, BluetoothManager, CharacteristicInfo, Command, DeviceId,
    DriverEvent, DriverEventReceiver, DriverEventSender, Error, PeripheralDevice, PowerState,
    RadioDriver, WriteMode,
};

/// Scripted stand-in for a radio backend.
struct FakeDriver {
    events: DriverEventSender,
    /// Devices emitted after each `start_scan`, each after its own delay.
    advertised: Mutex<Vec<(Duration, DeviceId, Option<String>, Option<i16>)>>,
    /// Services and their characteristic ids, reported during discovery.
    services: Mutex<Vec<(Uuid, Vec<String>)>>,
    power: Mutex<PowerState>,
    /// When false, `connect` never produces a `Connected` event.
    answer_connects: AtomicBool,
    /// When false, `discover_services` never produces an event.
    answer_discovery: AtomicBool,
    scan_calls: AtomicUsize,
    set_notify_calls: AtomicUsize,
}

impl FakeDriver {
    fn new() -> (Arc<Self>, DriverEventReceiver) {
        let (events, rx) = event_channel();
        (
            Arc::new(Self {
                events,
                advertised: Mutex::new(Vec::new()),
                services: Mutex::new(Vec::new()),
                power: Mutex::new(PowerState::PoweredOn),
                answer_connects: AtomicBool::new(true),
                answer_discovery: AtomicBool::new(true),
                scan_calls: AtomicUsize::new(0),
                set_notify_calls: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    fn advertise(&self, name: Option<&str>, rssi: i16, after: Duration) -> DeviceId {
        let id = DeviceId::new(format!("fake-{}", name.unwrap_or("anon")));
        self.advertised.lock().unwrap().push((
            after,
            id.clone(),
            name.map(str::to_string),
            Some(rssi),
        ));
        id
    }

    fn with_services(&self, services: &[(Uuid, &[&str])]) {
        *self.services.lock().unwrap() = services
            .iter()
            .map(|(uuid, chars)| (*uuid, chars.iter().map(|c| c.to_string()).collect()))
            .collect();
    }

    fn silent_connects(&self) {
        self.answer_connects.store(false, Ordering::SeqCst);
    }

    fn silent_discovery(&self) {
        self.answer_discovery.store(false, Ordering::SeqCst);
    }

    fn set_power_state(&self, state: PowerState) {
        *self.power.lock().unwrap() = state;
    }

    fn power_on(&self) {
        *self.power.lock().unwrap() = PowerState::PoweredOn;
        let _ = self
            .events
            .send(DriverEvent::PowerChanged(PowerState::PoweredOn));
    }

    /// Simulates an unsolicited link loss.
    fn drop_link(&self, id: &DeviceId) {
        let _ = self
            .events
            .send(DriverEvent::Disconnected { id: id.clone() });
    }

    fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    fn set_notify_calls(&self) -> usize {
        self.set_notify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioDriver for FakeDriver {
    fn power_state(&self) -> PowerState {
        *self.power.lock().unwrap()
    }

    async fn start_scan(&self, _service_filter: &[Uuid]) -> Result<()> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        for (after, id, name, rssi) in self.advertised.lock().unwrap().clone() {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let advertisement = Advertisement {
                    local_name: name.clone(),
                    ..Advertisement::default()
                };
                let _ = events.send(DriverEvent::DeviceDiscovered {
                    id,
                    name,
                    rssi,
                    advertisement,
                });
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        if self.answer_connects.load(Ordering::SeqCst) {
            let _ = self.events.send(DriverEvent::Connected {
                id: device.clone(),
            });
        }
        Ok(())
    }

    async fn cancel_connection(&self, device: &DeviceId) -> Result<()> {
        let _ = self.events.send(DriverEvent::Disconnected {
            id: device.clone(),
        });
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<()> {
        if self.answer_discovery.load(Ordering::SeqCst) {
            let services = self.services.lock().unwrap().iter().map(|(u, _)| *u).collect();
            let _ = self.events.send(DriverEvent::ServicesDiscovered {
                id: device.clone(),
                services,
                ok: true,
            });
        }
        Ok(())
    }

    async fn discover_characteristics(&self, device: &DeviceId, service: Uuid) -> Result<()> {
        let characteristics = self
            .services
            .lock()
            .unwrap()
            .iter()
            .find(|(u, _)| *u == service)
            .map(|(_, chars)| {
                chars
                    .iter()
                    .map(|c| CharacteristicInfo {
                        id: c.clone(),
                        service,
                        notifying: false,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let _ = self.events.send(DriverEvent::CharacteristicsDiscovered {
            id: device.clone(),
            service,
            characteristics,
            ok: true,
        });
        Ok(())
    }

    async fn read_value(&self, device: &DeviceId, characteristic: &str) -> Result<()> {
        let _ = self.events.send(DriverEvent::ValueUpdated {
            id: device.clone(),
            characteristic: characteristic.to_string(),
            value: vec![0x42, 0x43],
            ok: true,
        });
        Ok(())
    }

    async fn write_value(
        &self,
        device: &DeviceId,
        characteristic: &str,
        _value: &[u8],
        _mode: WriteMode,
    ) -> Result<()> {
        let _ = self.events.send(DriverEvent::WriteCompleted {
            id: device.clone(),
            characteristic: characteristic.to_string(),
            ok: true,
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        device: &DeviceId,
        characteristic: &str,
        enabled: bool,
    ) -> Result<()> {
        self.set_notify_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(DriverEvent::NotifyStateChanged {
            id: device.clone(),
            characteristic: characteristic.to_string(),
            enabled,
            ok: true,
        });
        Ok(())
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("callback channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Scans with an empty filter until `name` shows up, then stops the scan.
async fn first_matching_device(manager: &BluetoothManager, name: &str) -> PeripheralDevice {
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .scan(Vec::new(), move |devices| {
            let _ = tx.send(devices);
        })
        .await
        .expect("scan failed to start");
    let device = loop {
        let devices = recv(&mut rx).await;
        if let Some(found) = devices
            .into_iter()
            .find(|d| d.name.as_deref() == Some(name))
        {
            break found;
        }
    };
    manager.stop_scan().await.expect("stop_scan failed");
    device
}

async fn connect_to(
    manager: &BluetoothManager,
    fake: &FakeDriver,
    name: &str,
) -> PeripheralDevice {
    fake.advertise(Some(name), -40, Duration::from_millis(10));
    let device = first_matching_device(manager, name).await;
    assert!(
        manager.connect(&device, Duration::from_secs(5)).await,
        "connect failed"
    );
    manager.connected_device().expect("no connected device")
}

#[tokio::test(start_paused = true)]
async fn scan_reports_only_devices_matching_the_prefix_filter() {
    init_logs();
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    fake.advertise(Some("MyPump-12"), -50, Duration::from_millis(10));
    fake.advertise(Some("Sensor-1"), -40, Duration::from_millis(20));

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .scan(vec!["Pump".to_string()], move |devices| {
            let _ = tx.send(devices);
        })
        .await
        .unwrap();

    let devices = recv(&mut rx).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_deref(), Some("MyPump-12"));

    // Give the excluded device's report time to arrive; it must not appear.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.discovered_devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_filter_admits_named_and_unnamed_devices() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    fake.advertise(Some("MyPump-12"), -50, Duration::from_millis(10));
    fake.advertise(None, -40, Duration::from_millis(20));

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .scan(Vec::new(), move |devices| {
            let _ = tx.send(devices);
        })
        .await
        .unwrap();

    let devices = loop {
        let devices = recv(&mut rx).await;
        if devices.len() == 2 {
            break devices;
        }
    };
    // Stronger signal first, even unnamed.
    assert_eq!(devices[0].rssi, Some(-40));
    assert_eq!(devices[0].name, None);
    assert_eq!(devices[1].name.as_deref(), Some("MyPump-12"));
}

#[tokio::test(start_paused = true)]
async fn a_second_scan_while_scanning_is_refused() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);

    manager.scan(Vec::new(), |_| {}).await.unwrap();
    let err = manager.scan(Vec::new(), |_| {}).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));

    manager.stop_scan().await.unwrap();
    manager.scan(Vec::new(), |_| {}).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scan_requested_while_off_starts_on_power_on() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    fake.set_power_state(PowerState::PoweredOff);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err = manager
        .scan(Vec::new(), move |devices| {
            let _ = tx.send(devices);
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
    assert_eq!(fake.scan_calls(), 0);

    fake.advertise(Some("MyPump-12"), -50, Duration::from_millis(10));
    fake.power_on();

    let devices = recv(&mut rx).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(fake.scan_calls(), 1);
}

#[tokio::test]
async fn connect_fails_fast_for_a_detached_device() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);

    let ghost = PeripheralDevice::detached("ghost", Some("Ghost".to_string()));
    assert!(!manager.connect(&ghost, Duration::from_secs(1)).await);
    assert!(!manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_against_a_silent_driver() {
    init_logs();
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    fake.silent_connects();
    fake.advertise(Some("MyPump-12"), -50, Duration::from_millis(10));

    let device = first_matching_device(&manager, "MyPump-12").await;
    let started = tokio::time::Instant::now();
    assert!(!manager.connect(&device, Duration::from_secs(1)).await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned late: {elapsed:?}");
    assert!(!manager.is_connected());
    assert!(manager.last_connected_device().is_none());
}

#[tokio::test(start_paused = true)]
async fn discovery_cascade_accumulates_characteristics_across_services() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    let pump_service = Uuid::from_u128(0x1000);
    let battery_service = Uuid::from_u128(0x2000);
    fake.with_services(&[
        (pump_service, &["c1", "c2", "c3"]),
        (battery_service, &["c4", "c5"]),
    ]);

    let connected = connect_to(&manager, &fake, "MyPump-12").await;
    assert_eq!(connected.services, vec![pump_service, battery_service]);
    assert_eq!(connected.characteristics.len(), 5);
    assert_eq!(
        connected.characteristic("c2").unwrap().service,
        pump_service
    );
    assert_eq!(
        connected.characteristic("c4").unwrap().service,
        battery_service
    );
    assert!(connected.characteristics.values().all(|c| !c.notifying));
}

#[tokio::test(start_paused = true)]
async fn discovery_timeout_fails_the_connect_and_tears_down_the_link() {
    init_logs();
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    fake.silent_discovery();
    fake.advertise(Some("MyPump-12"), -50, Duration::from_millis(10));

    let device = first_matching_device(&manager, "MyPump-12").await;
    let started = tokio::time::Instant::now();
    assert!(!manager.connect(&device, Duration::from_secs(5)).await);
    // The failure comes from the 4s discovery phase bound, not the connect
    // deadline.
    assert!(started.elapsed() >= Duration::from_secs(4));
    wait_until(|| !manager.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn scan_and_connect_fires_once_with_the_matching_device() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    let service = Uuid::from_u128(0x1000);
    fake.with_services(&[(service, &["c1"])]);
    fake.advertise(Some("MyPump-12"), -40, Duration::from_millis(200));
    // A second match after the first must be ignored.
    fake.advertise(Some("MyPump-99"), -30, Duration::from_millis(400));

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counted = calls.clone();
    manager.scan_and_connect("Pump", Duration::from_secs(5), move |device| {
        counted.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(device);
    });

    let device = recv(&mut rx).await.expect("expected a connected device");
    assert_eq!(device.name.as_deref(), Some("MyPump-12"));
    assert!(manager.is_connected());

    // Run past the deadline: the callback must not fire again.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn scan_and_connect_times_out_exactly_once_without_a_match() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    fake.advertise(Some("Sensor-1"), -40, Duration::from_millis(100));

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counted = calls.clone();
    manager.scan_and_connect("Pump", Duration::from_millis(500), move |device| {
        counted.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(device);
    });

    assert!(recv(&mut rx).await.is_none());
    assert!(!manager.is_connected());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_without_history_reports_false_immediately() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.reconnect(Duration::from_secs(1), move |ok| {
        let _ = tx.send(ok);
    });
    assert!(!recv(&mut rx).await);
}

#[tokio::test(start_paused = true)]
async fn reconnect_scans_for_the_last_connected_name() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    let service = Uuid::from_u128(0x1000);
    fake.with_services(&[(service, &["c1"])]);

    let device = connect_to(&manager, &fake, "MyPump-12").await;
    fake.drop_link(device.id());
    wait_until(|| !manager.is_connected()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.reconnect(Duration::from_secs(5), move |ok| {
        let _ = tx.send(ok);
    });
    assert!(recv(&mut rx).await);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn unsolicited_disconnect_clears_the_connection() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);

    let device = connect_to(&manager, &fake, "MyPump-12").await;
    assert!(manager.is_connected());

    fake.drop_link(device.id());
    wait_until(|| !manager.is_connected()).await;
    // The reconnect target survives the disconnect.
    assert_eq!(
        manager.last_connected_device().unwrap().id(),
        device.id()
    );
}

#[tokio::test(start_paused = true)]
async fn subscribe_is_idempotent_once_notifying() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    let service = Uuid::from_u128(0x1000);
    fake.with_services(&[(service, &["c1"])]);
    connect_to(&manager, &fake, "MyPump-12").await;

    manager.subscribe("c1").await.unwrap();
    assert_eq!(fake.set_notify_calls(), 1);

    // Already notifying: no second driver request, returns immediately.
    manager.subscribe("c1").await.unwrap();
    assert_eq!(fake.set_notify_calls(), 1);

    manager.unsubscribe("c1").await.unwrap();
    assert_eq!(fake.set_notify_calls(), 2);
    manager.unsubscribe("c1").await.unwrap();
    assert_eq!(fake.set_notify_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn read_and_write_results_arrive_on_callbacks() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);
    let service = Uuid::from_u128(0x1000);
    fake.with_services(&[(service, &["c1"])]);
    connect_to(&manager, &fake, "MyPump-12").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .read_data("c1", move |device, response, ok| {
            let _ = tx.send((device, response, ok));
        })
        .await
        .unwrap();
    let (device, response, ok) = recv(&mut rx).await;
    assert!(ok);
    assert_eq!(device.name.as_deref(), Some("MyPump-12"));
    assert_eq!(response.as_bytes(), &[0x42, 0x43]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .write(
            &Command::from(vec![0x01, 0x02]),
            "c1",
            WriteMode::WithResponse,
            move |_, ok| {
                let _ = tx.send(ok);
            },
        )
        .await
        .unwrap();
    assert!(recv(&mut rx).await);
}

#[tokio::test]
async fn io_requires_a_connection_and_a_known_characteristic() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);

    let err = manager.read_data("c1", |_, _, _| {}).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    let service = Uuid::from_u128(0x1000);
    fake.with_services(&[(service, &["c1"])]);
    connect_to(&manager, &fake, "MyPump-12").await;

    let err = manager.read_data("nope", |_, _, _| {}).await.unwrap_err();
    assert!(matches!(err, Error::UnknownCharacteristic(_)));
    let err = manager.subscribe("nope").await.unwrap_err();
    assert!(matches!(err, Error::UnknownCharacteristic(_)));
}

#[tokio::test(start_paused = true)]
async fn observer_sees_initial_state_and_each_genuine_transition() {
    let (fake, events) = FakeDriver::new();
    let manager = BluetoothManager::new(fake.clone(), events);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = manager.register_connection_observer(move |connected, was_connected| {
        let _ = tx.send((connected, was_connected));
    });

    // Current state, delivered before any transition.
    assert_eq!(recv(&mut rx).await, (false, false));

    connect_to(&manager, &fake, "MyPump-12").await;
    assert_eq!(recv(&mut rx).await, (true, false));

    manager.disconnect().await;
    assert_eq!(recv(&mut rx).await, (false, true));

    manager.remove_connection_observer(handle);
    connect_to(&manager, &fake, "MyPump-12").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}
