//! Single entry point for all driver-originated events.
//!
//! One spawned task consumes the driver's event channel. Every handler is a
//! bounded state update followed by at most one gate signal and one posted
//! callback; nothing here waits on the radio. The one driver request issued
//! from this task (resuming a pending scan on power-on) is fire-and-forget.

use std::sync::Arc;

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::{Advertisement, CharacteristicInfo, DeviceId, PeripheralDevice};
use crate::driver::{DriverEvent, DriverEventReceiver, PowerState, RadioDriver};
use crate::gates::GateKind;
use crate::state::{LinkPhase, Shared};

pub(crate) fn spawn(
    shared: Arc<Shared>,
    driver: Arc<dyn RadioDriver>,
    events: DriverEventReceiver,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(shared, driver, events))
}

async fn run(shared: Arc<Shared>, driver: Arc<dyn RadioDriver>, mut events: DriverEventReceiver) {
    debug!("event dispatcher started");
    while let Some(event) = events.recv().await {
        handle(&shared, &driver, event).await;
    }
    debug!("driver event channel closed, dispatcher exiting");
}

async fn handle(shared: &Shared, driver: &Arc<dyn RadioDriver>, event: DriverEvent) {
    match event {
        DriverEvent::PowerChanged(state) => on_power_changed(shared, driver, state).await,
        DriverEvent::DeviceDiscovered {
            id,
            name,
            rssi,
            advertisement,
        } => on_device_discovered(shared, id, name, rssi, advertisement),
        DriverEvent::Connected { id } => on_connected(shared, id),
        DriverEvent::Disconnected { id } => on_disconnected(shared, id),
        DriverEvent::ServicesDiscovered { id, services, ok } => {
            on_services_discovered(shared, id, services, ok)
        }
        DriverEvent::CharacteristicsDiscovered {
            id,
            service,
            characteristics,
            ok,
        } => on_characteristics_discovered(shared, id, service, characteristics, ok),
        DriverEvent::ValueUpdated {
            id,
            characteristic,
            value,
            ok,
        } => on_value_updated(shared, id, characteristic, value, ok),
        DriverEvent::WriteCompleted { id, ok, .. } => on_write_completed(shared, id, ok),
        DriverEvent::NotifyStateChanged {
            id,
            characteristic,
            enabled,
            ok,
        } => on_notify_state_changed(shared, id, characteristic, enabled, ok),
    }
}

async fn on_power_changed(shared: &Shared, driver: &Arc<dyn RadioDriver>, state: PowerState) {
    let resume_scan = {
        let mut inner = shared.inner.lock().unwrap();
        if state == PowerState::PoweredOn && inner.scan_pending {
            inner.scan_pending = false;
            inner.phase = LinkPhase::Scanning;
            true
        } else {
            false
        }
    };

    match state {
        PowerState::PoweredOn => info!("radio powered on"),
        PowerState::PoweredOff => info!("radio powered off"),
        PowerState::Unsupported | PowerState::Unauthorized => {
            warn!("radio unusable: {state:?}")
        }
        PowerState::Unknown | PowerState::Resetting => debug!("radio state: {state:?}"),
    }

    if resume_scan {
        info!("resuming scan deferred while the radio was off");
        if let Err(e) = driver.start_scan(&[]).await {
            error!("failed to resume scan: {e:#}");
        }
    }
}

fn on_device_discovered(
    shared: &Shared,
    id: DeviceId,
    name: Option<String>,
    rssi: Option<i16>,
    advertisement: Advertisement,
) {
    let mut matched = false;
    let snapshot = {
        let mut inner = shared.inner.lock().unwrap();
        let device = PeripheralDevice::discovered(id, name, rssi, advertisement);
        if !device.name_matches(&inner.scan_prefixes) {
            return;
        }

        // First hit for a running scan-and-connect wins; later results are
        // ignored once the gate has been signaled.
        let pending_hit = inner.pending_match.as_deref().is_some_and(|prefix| {
            device.name.as_deref().is_some_and(|n| n.contains(prefix))
        });
        if pending_hit {
            debug!("scan-and-connect matched {}", device.id());
            inner.matched = Some(device.clone());
            inner.pending_match = None;
            matched = true;
        }

        if inner.registry.upsert(device, true) {
            inner
                .scan_callback
                .clone()
                .map(|callback| (callback, inner.registry.snapshot()))
        } else {
            None
        }
    };

    if matched {
        shared.gates.signal(GateKind::ScanAndConnect);
    }
    if let Some((callback, devices)) = snapshot {
        shared.callbacks.post(move || callback(devices));
    }
}

fn on_connected(shared: &Shared, id: DeviceId) {
    let was_connected = {
        let mut inner = shared.inner.lock().unwrap();
        let was = inner.connected.is_some();
        let device = inner
            .registry
            .get(&id)
            .cloned()
            .or_else(|| inner.matched.clone().filter(|d| d.id() == &id))
            .unwrap_or_else(|| {
                PeripheralDevice::discovered(id.clone(), None, None, Advertisement::default())
            });
        info!("device connected: {id}");
        inner.phase = LinkPhase::Connected(id);
        inner.connected = Some(device);
        was
    };
    shared.gates.signal(GateKind::Connecting);
    shared.notify_observers(was_connected, true);
}

fn on_disconnected(shared: &Shared, id: DeviceId) {
    let was_connected = {
        let mut inner = shared.inner.lock().unwrap();
        let was = inner.connected.is_some();
        info!("device disconnected: {id}");
        inner.connected = None;
        inner.phase = LinkPhase::Idle;
        was
    };
    shared.notify_observers(was_connected, false);
}

fn on_services_discovered(shared: &Shared, id: DeviceId, services: Vec<Uuid>, ok: bool) {
    {
        let mut inner = shared.inner.lock().unwrap();
        if !ok {
            warn!("service discovery failed for {id}");
            inner.discovery_error = true;
        } else if let Some(device) = inner.connected.as_mut().filter(|d| d.id() == &id) {
            debug!("{} services discovered on {id}", services.len());
            device.services = services;
        }
    }
    shared.gates.signal(GateKind::ServiceDiscovery);
}

fn on_characteristics_discovered(
    shared: &Shared,
    id: DeviceId,
    service: Uuid,
    characteristics: Vec<CharacteristicInfo>,
    ok: bool,
) {
    {
        let mut inner = shared.inner.lock().unwrap();
        if !ok {
            warn!("characteristic discovery failed for service {service} on {id}");
            inner.discovery_error = true;
        } else if let Some(device) = inner.connected.as_mut().filter(|d| d.id() == &id) {
            debug!(
                "{} characteristics discovered on {id} for service {service}",
                characteristics.len()
            );
            for info in characteristics {
                device.characteristics.insert(info.id.clone(), info);
            }
        }
    }
    shared.gates.signal(GateKind::CharacteristicDiscovery);
}

fn on_value_updated(shared: &Shared, id: DeviceId, characteristic: String, value: Vec<u8>, ok: bool) {
    let delivery = {
        let inner = shared.inner.lock().unwrap();
        match (&inner.connected, &inner.read_callback) {
            (Some(device), Some(callback)) if device.id() == &id => {
                Some((callback.clone(), device.clone()))
            }
            _ => None,
        }
    };
    match delivery {
        Some((callback, device)) => shared
            .callbacks
            .post(move || callback(device, crate::commands::Response::new(value), ok)),
        None => debug!("value update for {characteristic} on {id} with no registered reader"),
    }
}

fn on_write_completed(shared: &Shared, id: DeviceId, ok: bool) {
    let delivery = {
        let inner = shared.inner.lock().unwrap();
        match (&inner.connected, &inner.write_callback) {
            (Some(device), Some(callback)) if device.id() == &id => {
                Some((callback.clone(), device.clone()))
            }
            _ => None,
        }
    };
    if let Some((callback, device)) = delivery {
        shared.callbacks.post(move || callback(device, ok));
    }
}

fn on_notify_state_changed(
    shared: &Shared,
    id: DeviceId,
    characteristic: String,
    enabled: bool,
    ok: bool,
) {
    {
        let mut inner = shared.inner.lock().unwrap();
        if ok {
            if let Some(device) = inner.connected.as_mut().filter(|d| d.id() == &id) {
                if let Some(info) = device.characteristics.get_mut(&characteristic) {
                    info.notifying = enabled;
                }
            }
        } else {
            warn!("notification toggle failed for {characteristic} on {id}");
        }
    }
    shared.gates.signal(GateKind::SubscribeToggle);
}
