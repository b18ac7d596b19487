//! [`RadioDriver`] implementation over the cross-platform `bluest` stack.
//!
//! Scan results and notification values arrive on bluest streams; each is
//! consumed by a spawned task that forwards them onto the driver event
//! channel until its cancellation token fires. Live bluest handles (devices,
//! services, characteristics) are cached here so the coordinator can address
//! everything by plain identifiers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::{Advertisement, CharacteristicInfo, DeviceId};
use crate::driver::{
    DriverEvent, DriverEventReceiver, DriverEventSender, PowerState, RadioDriver, WriteMode,
    event_channel,
};

/// Live bluest handles for the current session. Services and
/// characteristics are scoped to the single managed connection and cleared
/// on disconnect.
#[derive(Default)]
struct Handles {
    devices: HashMap<DeviceId, Device>,
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<String, Characteristic>,
    notify_tasks: HashMap<String, CancellationToken>,
}

pub struct BluestDriver {
    adapter: Adapter,
    events: DriverEventSender,
    handles: Arc<Mutex<Handles>>,
    power: Mutex<PowerState>,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BluestDriver {
    /// Acquires the default adapter and starts power reporting. Returns the
    /// driver together with the event stream to hand to
    /// [`crate::BluetoothManager::new`].
    pub async fn new() -> Result<(Arc<Self>, DriverEventReceiver)> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("no bluetooth adapter found"))?;
        let (tx, rx) = event_channel();
        let driver = Arc::new(Self {
            adapter,
            events: tx,
            handles: Arc::new(Mutex::new(Handles::default())),
            power: Mutex::new(PowerState::Unknown),
            scan_cancel: Mutex::new(None),
        });

        let watcher = driver.clone();
        tokio::spawn(async move {
            match watcher.adapter.wait_available().await {
                Ok(()) => {
                    info!("bluetooth adapter is available");
                    watcher.set_power(PowerState::PoweredOn);
                }
                Err(e) => {
                    error!("bluetooth adapter unavailable: {e}");
                    watcher.set_power(PowerState::PoweredOff);
                }
            }
        });

        Ok((driver, rx))
    }

    fn set_power(&self, state: PowerState) {
        *self.power.lock().unwrap() = state;
        let _ = self.events.send(DriverEvent::PowerChanged(state));
    }

    fn device(&self, id: &DeviceId) -> Result<Device> {
        self.handles
            .lock()
            .unwrap()
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no handle for device {id}"))
    }

    fn service(&self, uuid: Uuid) -> Result<Service> {
        self.handles
            .lock()
            .unwrap()
            .services
            .get(&uuid)
            .cloned()
            .ok_or_else(|| anyhow!("no handle for service {uuid}"))
    }

    fn characteristic(&self, id: &str) -> Result<Characteristic> {
        self.handles
            .lock()
            .unwrap()
            .characteristics
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no handle for characteristic {id}"))
    }

    /// Drops every per-connection handle and cancels notification tasks.
    fn clear_connection_handles(&self) {
        let mut handles = self.handles.lock().unwrap();
        for (_, token) in handles.notify_tasks.drain() {
            token.cancel();
        }
        handles.services.clear();
        handles.characteristics.clear();
    }
}

#[async_trait::async_trait]
impl RadioDriver for BluestDriver {
    fn power_state(&self) -> PowerState {
        *self.power.lock().unwrap()
    }

    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.scan_cancel.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let handles = self.handles.clone();
        let filter = service_filter.to_vec();

        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to start scan: {e}");
                    return;
                }
            };
            info!("bluetooth scan started");
            loop {
                tokio::select! {
                    next = scan_stream.next() => {
                        match next {
                            Some(found) => {
                                let device = found.device;
                                let id = DeviceId::new(device.id().to_string());
                                let name = device.name().ok();
                                let advertisement = convert_advertisement(&found.adv_data);
                                debug!("discovered {id} ({name:?}), rssi {:?}", found.rssi);
                                handles.lock().unwrap().devices.insert(id.clone(), device);
                                let _ = events.send(DriverEvent::DeviceDiscovered {
                                    id,
                                    name,
                                    rssi: found.rssi,
                                    advertisement,
                                });
                            }
                            None => {
                                info!("bluetooth scan stream has ended");
                                break;
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("scan cancelled");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        if device.is_connected().await {
            info!("device {id} already connected");
        } else {
            info!("initiating connection to {id}");
            self.adapter.connect_device(&device).await?;
        }
        let _ = self.events.send(DriverEvent::Connected { id: id.clone() });
        Ok(())
    }

    async fn cancel_connection(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        self.clear_connection_handles();
        if device.is_connected().await {
            info!("disconnecting from device {id}");
            self.adapter.disconnect_device(&device).await?;
        } else {
            info!("device {id} not connected");
        }
        let _ = self.events.send(DriverEvent::Disconnected { id: id.clone() });
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        match device.services().await {
            Ok(services) => {
                let uuids: Vec<Uuid> = services.iter().map(|s| s.uuid()).collect();
                debug!("found {} services on {id}", uuids.len());
                self.handles.lock().unwrap().services =
                    services.into_iter().map(|s| (s.uuid(), s)).collect();
                let _ = self.events.send(DriverEvent::ServicesDiscovered {
                    id: id.clone(),
                    services: uuids,
                    ok: true,
                });
            }
            Err(e) => {
                warn!("service discovery failed for {id}: {e}");
                let _ = self.events.send(DriverEvent::ServicesDiscovered {
                    id: id.clone(),
                    services: Vec::new(),
                    ok: false,
                });
            }
        }
        Ok(())
    }

    async fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<()> {
        let svc = self.service(service)?;
        match svc.characteristics().await {
            Ok(characteristics) => {
                let infos: Vec<CharacteristicInfo> = characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        id: c.uuid().to_string(),
                        service,
                        notifying: false,
                    })
                    .collect();
                debug!("found {} characteristics in {service}", infos.len());
                {
                    let mut handles = self.handles.lock().unwrap();
                    for characteristic in characteristics {
                        handles
                            .characteristics
                            .insert(characteristic.uuid().to_string(), characteristic);
                    }
                }
                let _ = self.events.send(DriverEvent::CharacteristicsDiscovered {
                    id: id.clone(),
                    service,
                    characteristics: infos,
                    ok: true,
                });
            }
            Err(e) => {
                warn!("characteristic discovery failed for {service} on {id}: {e}");
                let _ = self.events.send(DriverEvent::CharacteristicsDiscovered {
                    id: id.clone(),
                    service,
                    characteristics: Vec::new(),
                    ok: false,
                });
            }
        }
        Ok(())
    }

    async fn read_value(&self, id: &DeviceId, characteristic: &str) -> Result<()> {
        let ch = self.characteristic(characteristic)?;
        let event = match ch.read().await {
            Ok(value) => DriverEvent::ValueUpdated {
                id: id.clone(),
                characteristic: characteristic.to_string(),
                value,
                ok: true,
            },
            Err(e) => {
                warn!("read of {characteristic} failed: {e}");
                DriverEvent::ValueUpdated {
                    id: id.clone(),
                    characteristic: characteristic.to_string(),
                    value: Vec::new(),
                    ok: false,
                }
            }
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn write_value(
        &self,
        id: &DeviceId,
        characteristic: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let ch = self.characteristic(characteristic)?;
        let result = match mode {
            WriteMode::WithResponse => ch.write(value).await,
            WriteMode::WithoutResponse => ch.write_without_response(value).await,
        };
        if let Err(e) = &result {
            warn!("write to {characteristic} failed: {e}");
        }
        let _ = self.events.send(DriverEvent::WriteCompleted {
            id: id.clone(),
            characteristic: characteristic.to_string(),
            ok: result.is_ok(),
        });
        Ok(())
    }

    async fn set_notify(&self, id: &DeviceId, characteristic: &str, enabled: bool) -> Result<()> {
        if !enabled {
            let token = self
                .handles
                .lock()
                .unwrap()
                .notify_tasks
                .remove(characteristic);
            if let Some(token) = token {
                token.cancel();
            }
            let _ = self.events.send(DriverEvent::NotifyStateChanged {
                id: id.clone(),
                characteristic: characteristic.to_string(),
                enabled: false,
                ok: true,
            });
            return Ok(());
        }

        let ch = self.characteristic(characteristic)?;
        let token = CancellationToken::new();
        self.handles
            .lock()
            .unwrap()
            .notify_tasks
            .insert(characteristic.to_string(), token.clone());

        let events = self.events.clone();
        let id = id.clone();
        let char_id = characteristic.to_string();
        tokio::spawn(async move {
            match ch.notify().await {
                Ok(mut notification_stream) => {
                    let _ = events.send(DriverEvent::NotifyStateChanged {
                        id: id.clone(),
                        characteristic: char_id.clone(),
                        enabled: true,
                        ok: true,
                    });
                    info!("listening for notifications on {char_id}");
                    loop {
                        tokio::select! {
                            next = notification_stream.next() => {
                                match next {
                                    Some(Ok(value)) => {
                                        let _ = events.send(DriverEvent::ValueUpdated {
                                            id: id.clone(),
                                            characteristic: char_id.clone(),
                                            value,
                                            ok: true,
                                        });
                                    }
                                    Some(Err(e)) => {
                                        error!("error in notification stream: {e}");
                                        let _ = events.send(DriverEvent::ValueUpdated {
                                            id: id.clone(),
                                            characteristic: char_id.clone(),
                                            value: Vec::new(),
                                            ok: false,
                                        });
                                        break;
                                    }
                                    None => {
                                        info!("notification stream ended for {char_id}");
                                        break;
                                    }
                                }
                            }
                            _ = token.cancelled() => break,
                        }
                    }
                }
                Err(e) => {
                    error!("failed to subscribe to notifications: {e}");
                    let _ = events.send(DriverEvent::NotifyStateChanged {
                        id,
                        characteristic: char_id,
                        enabled: true,
                        ok: false,
                    });
                }
            }
        });
        Ok(())
    }
}

fn convert_advertisement(adv: &bluest::AdvertisementData) -> Advertisement {
    Advertisement {
        local_name: adv.local_name.clone(),
        manufacturer_data: adv
            .manufacturer_data
            .as_ref()
            .map(|m| (m.company_id, m.data.to_vec())),
        services: adv.services.to_vec(),
        tx_power: adv.tx_power_level,
        is_connectable: adv.is_connectable,
    }
}
