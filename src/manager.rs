//! The connection coordinator.
//!
//! Owns the active-connection state machine and exposes the crate's public
//! operations. Every operation arms the relevant gate before issuing its
//! driver request, then suspends until the dispatcher signals it or the
//! deadline passes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::callbacks::CallbackQueue;
use crate::constants::DISCOVERY_PHASE_TIMEOUT;
use crate::device::{DeviceId, PeripheralDevice};
use crate::dispatcher;
use crate::driver::{DriverEventReceiver, PowerState, RadioDriver};
use crate::error::Error;
use crate::gates::{GateKind, WaitOutcome};
use crate::state::{ConnectionObserver, LinkPhase, ObserverHandle, Shared};

/// Central-role coordinator over a [`RadioDriver`].
///
/// Construct exactly one per radio and clone it freely; clones share the
/// same connection state. There is no implicit global instance.
#[derive(Clone)]
pub struct BluetoothManager {
    pub(crate) shared: Arc<Shared>,
    pub(crate) driver: Arc<dyn RadioDriver>,
}

impl BluetoothManager {
    /// Builds the coordinator and spawns its dispatcher and callback-queue
    /// tasks on the current tokio runtime. `events` is the receiving half of
    /// the driver's event channel.
    pub fn new(driver: Arc<dyn RadioDriver>, events: DriverEventReceiver) -> Self {
        let shared = Shared::new(CallbackQueue::spawn());
        dispatcher::spawn(shared.clone(), driver.clone(), events);
        Self { shared, driver }
    }

    /// Starts a scan session.
    ///
    /// `prefixes`, when non-empty, admits only named devices whose name
    /// contains one of the entries (case-sensitive). Every discovery that
    /// visibly changes the registry re-invokes `on_result` with the full
    /// sorted device list (a latest snapshot, not a delta).
    ///
    /// With the radio off, the request is retained and issued automatically
    /// on power-on; `NotReady` is still returned so the caller knows nothing
    /// is running yet.
    pub async fn scan(
        &self,
        prefixes: Vec<String>,
        on_result: impl Fn(Vec<PeripheralDevice>) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.phase == LinkPhase::Scanning {
                return Err(Error::NotReady("scan already running"));
            }
            inner.registry.reset();
            inner.scan_prefixes = prefixes;
            inner.scan_callback = Some(Arc::new(on_result));
            if self.driver.power_state() != PowerState::PoweredOn {
                info!("radio not powered, scan deferred until power-on");
                inner.scan_pending = true;
                return Err(Error::NotReady("radio is not powered on"));
            }
            inner.phase = LinkPhase::Scanning;
        }

        info!("starting device scan");
        if let Err(e) = self.driver.start_scan(&[]).await {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.phase == LinkPhase::Scanning {
                inner.phase = LinkPhase::Idle;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops the current scan session, if any.
    pub async fn stop_scan(&self) -> Result<(), Error> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.scan_pending = false;
            if inner.phase == LinkPhase::Scanning {
                inner.phase = LinkPhase::Idle;
            }
        }
        debug!("stopping device scan");
        self.driver.stop_scan().await?;
        Ok(())
    }

    /// Connects to a discovered device and runs the discovery cascade.
    ///
    /// Returns `true` only if the link came up within `timeout` AND service
    /// and characteristic enumeration completed within their per-phase
    /// bounds. On a connect timeout, no connection state is mutated.
    pub async fn connect(&self, device: &PeripheralDevice, timeout: Duration) -> bool {
        if !device.has_driver_handle() {
            warn!("connect refused: no driver handle for {}", device.id());
            return false;
        }
        let id = device.id().clone();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if matches!(
                inner.phase,
                LinkPhase::Connecting(_) | LinkPhase::Connected(_) | LinkPhase::Disconnecting
            ) {
                warn!("connect refused: another connection is in progress");
                return false;
            }
            inner.phase = LinkPhase::Connecting(id.clone());
        }

        let gate = self.shared.gates.arm(GateKind::Connecting);
        info!("connecting to {id}");
        if let Err(e) = self.driver.connect(&id).await {
            error!("connect request failed: {e:#}");
            self.clear_connecting_phase(&id);
            return false;
        }

        match gate.wait(timeout).await {
            WaitOutcome::TimedOut => {
                warn!("connect to {id} timed out");
                self.clear_connecting_phase(&id);
                false
            }
            WaitOutcome::Signaled => {
                {
                    let mut inner = self.shared.inner.lock().unwrap();
                    match inner.connected.clone() {
                        Some(connected) => inner.last_connected = Some(connected),
                        None => {
                            // The link dropped between the signal and now.
                            inner.phase = LinkPhase::Idle;
                            return false;
                        }
                    }
                }
                info!("connection established, discovering services...");
                self.run_discovery_cascade(&id).await
            }
        }
    }

    /// Enumerates services and, per service, characteristics on the
    /// currently connected device. Runs automatically after `connect`;
    /// public for re-discovery after a reconnect.
    pub async fn discover_services_and_characteristics(&self) -> bool {
        let id = {
            let inner = self.shared.inner.lock().unwrap();
            inner.connected.as_ref().map(|d| d.id().clone())
        };
        match id {
            Some(id) => self.run_discovery_cascade(&id).await,
            None => {
                warn!("discovery requested with no device connected");
                false
            }
        }
    }

    /// Sequential service-then-characteristic enumeration. One gate exists
    /// per phase kind and the driver result is scoped per service, so the
    /// per-service loop re-arms the same gate each iteration. On a phase
    /// timeout or driver-reported failure the link is torn down rather than
    /// left connected but unusable.
    async fn run_discovery_cascade(&self, id: &DeviceId) -> bool {
        self.shared.inner.lock().unwrap().discovery_error = false;

        let gate = self.shared.gates.arm(GateKind::ServiceDiscovery);
        if let Err(e) = self.driver.discover_services(id).await {
            error!("service discovery request failed: {e:#}");
            self.abort_connection(id).await;
            return false;
        }
        if gate.wait(DISCOVERY_PHASE_TIMEOUT).await == WaitOutcome::TimedOut {
            warn!("service discovery timed out for {id}");
            self.abort_connection(id).await;
            return false;
        }

        let services = {
            let inner = self.shared.inner.lock().unwrap();
            if inner.discovery_error {
                None
            } else {
                inner
                    .connected
                    .as_ref()
                    .filter(|d| d.id() == id)
                    .map(|d| d.services.clone())
            }
        };
        let Some(services) = services else {
            self.abort_connection(id).await;
            return false;
        };

        for service in services {
            let gate = self.shared.gates.arm(GateKind::CharacteristicDiscovery);
            if let Err(e) = self.driver.discover_characteristics(id, service).await {
                error!("characteristic discovery request failed: {e:#}");
                self.abort_connection(id).await;
                return false;
            }
            if gate.wait(DISCOVERY_PHASE_TIMEOUT).await == WaitOutcome::TimedOut {
                warn!("characteristic discovery timed out for service {service} on {id}");
                self.abort_connection(id).await;
                return false;
            }
            if self.shared.inner.lock().unwrap().discovery_error {
                self.abort_connection(id).await;
                return false;
            }
        }

        let summary = {
            let inner = self.shared.inner.lock().unwrap();
            inner
                .connected
                .as_ref()
                .map(|d| (d.services.len(), d.characteristics.len()))
        };
        match summary {
            Some((services, characteristics)) => {
                info!("discovery complete: {services} services, {characteristics} characteristics");
                true
            }
            None => false,
        }
    }

    /// Scans for the first device whose name contains `prefix` and connects
    /// to it, off the caller's task. `callback` fires exactly once with the
    /// connected device, or with `None` when no match appeared within
    /// `timeout` or the connect failed.
    pub fn scan_and_connect(
        &self,
        prefix: impl Into<String>,
        timeout: Duration,
        callback: impl FnOnce(Option<PeripheralDevice>) + Send + 'static,
    ) {
        let this = self.clone();
        let prefix = prefix.into();
        tokio::spawn(async move {
            let gate = this.shared.gates.arm(GateKind::ScanAndConnect);
            {
                let mut inner = this.shared.inner.lock().unwrap();
                inner.pending_match = Some(prefix.clone());
                inner.matched = None;
            }
            if let Err(e) = this.scan(vec![prefix.clone()], |_| {}).await {
                // A deferred scan may still start within the deadline.
                debug!("scan-and-connect: scan not started immediately: {e}");
            }

            let result = match gate.wait(timeout).await {
                WaitOutcome::TimedOut => {
                    info!("scan-and-connect: no device matching {prefix:?} within deadline");
                    this.shared.inner.lock().unwrap().pending_match = None;
                    if let Err(e) = this.stop_scan().await {
                        warn!("scan-and-connect: failed to stop scan: {e}");
                    }
                    None
                }
                WaitOutcome::Signaled => {
                    let matched = this.shared.inner.lock().unwrap().matched.take();
                    if let Err(e) = this.stop_scan().await {
                        warn!("scan-and-connect: failed to stop scan: {e}");
                    }
                    match matched {
                        Some(device) => {
                            if this.connect(&device, timeout).await {
                                // Hand back the live record, with its
                                // discovered services and characteristics.
                                this.connected_device()
                            } else {
                                None
                            }
                        }
                        None => None,
                    }
                }
            };
            this.shared.callbacks.post(move || callback(result));
        });
    }

    /// Reconnects to the last successfully connected device by scanning for
    /// its name. `callback(false)` fires immediately when there is no such
    /// device (or it was unnamed).
    pub fn reconnect(&self, timeout: Duration, callback: impl FnOnce(bool) + Send + 'static) {
        let name = {
            let inner = self.shared.inner.lock().unwrap();
            inner.last_connected.as_ref().and_then(|d| d.name.clone())
        };
        match name {
            None => {
                info!("reconnect requested with no previous device");
                self.shared.callbacks.post(move || callback(false));
            }
            Some(name) => {
                info!("reconnecting to {name:?}");
                self.scan_and_connect(name, timeout, move |device| callback(device.is_some()));
            }
        }
    }

    /// Requests a disconnect. No-op without a connected device. The state
    /// transition to idle happens when the driver reports the disconnect,
    /// not inside this call.
    pub async fn disconnect(&self) {
        let id = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.connected.as_ref() {
                None => {
                    debug!("disconnect requested with no device connected");
                    return;
                }
                Some(device) => {
                    let id = device.id().clone();
                    inner.phase = LinkPhase::Disconnecting;
                    id
                }
            }
        };
        info!("disconnecting from {id}");
        if let Err(e) = self.driver.cancel_connection(&id).await {
            error!("disconnect request failed: {e:#}");
        }
    }

    /// Registers a connection observer. It is invoked once, scheduled
    /// immediately, with `(connected, connected)` for the current state, and
    /// then once per genuine connected/disconnected transition with
    /// `(connected, was_connected)`.
    pub fn register_connection_observer(
        &self,
        on_change: impl Fn(bool, bool) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let observer: ConnectionObserver = Arc::new(on_change);
        let (handle, connected) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let handle = ObserverHandle(inner.next_observer);
            inner.next_observer += 1;
            inner.observers.push((handle.0, observer.clone()));
            (handle, inner.connected.is_some())
        };
        self.shared
            .callbacks
            .post(move || observer(connected, connected));
        handle
    }

    pub fn remove_connection_observer(&self, handle: ObserverHandle) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.observers.retain(|(id, _)| *id != handle.0);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().unwrap().connected.is_some()
    }

    /// Current position in the connection lifecycle.
    pub fn phase(&self) -> LinkPhase {
        self.shared.inner.lock().unwrap().phase.clone()
    }

    /// Snapshot of the currently connected device, if any.
    pub fn connected_device(&self) -> Option<PeripheralDevice> {
        self.shared.inner.lock().unwrap().connected.clone()
    }

    /// The device of the last successful connection; survives disconnects.
    pub fn last_connected_device(&self) -> Option<PeripheralDevice> {
        self.shared.inner.lock().unwrap().last_connected.clone()
    }

    /// Snapshot of the current scan session's registry.
    pub fn discovered_devices(&self) -> Vec<PeripheralDevice> {
        self.shared.inner.lock().unwrap().registry.snapshot()
    }

    fn clear_connecting_phase(&self, id: &DeviceId) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.phase == LinkPhase::Connecting(id.clone()) {
            inner.phase = LinkPhase::Idle;
        }
    }

    /// Tears down a link the cascade left unusable.
    async fn abort_connection(&self, id: &DeviceId) {
        warn!("aborting connection to {id}");
        self.shared.inner.lock().unwrap().phase = LinkPhase::Disconnecting;
        if let Err(e) = self.driver.cancel_connection(id).await {
            error!("failed to abort connection: {e:#}");
            // Force the state down; the driver gave us nothing to wait for.
            let was_connected = {
                let mut inner = self.shared.inner.lock().unwrap();
                let was = inner.connected.is_some();
                inner.connected = None;
                inner.phase = LinkPhase::Idle;
                was
            };
            self.shared.notify_observers(was_connected, false);
        }
    }
}
