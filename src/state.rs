//! Shared connection state.
//!
//! `connected`, `last_connected` and the registry are composed together by
//! `connect`, so all of them sit behind one mutex rather than per-field
//! locks. The guard is never held across an `.await`; helpers that lock
//! internally must only be called with the guard released.

use std::sync::{Arc, Mutex};

use crate::callbacks::CallbackQueue;
use crate::commands::Response;
use crate::device::{DeviceId, PeripheralDevice};
use crate::gates::Gates;
use crate::registry::DeviceRegistry;

/// Lifecycle of the single managed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Scanning,
    Connecting(DeviceId),
    Connected(DeviceId),
    Disconnecting,
}

pub(crate) type ScanCallback = Arc<dyn Fn(Vec<PeripheralDevice>) + Send + Sync>;
pub(crate) type ReadCallback = Arc<dyn Fn(PeripheralDevice, Response, bool) + Send + Sync>;
pub(crate) type WriteCallback = Arc<dyn Fn(PeripheralDevice, bool) + Send + Sync>;
pub(crate) type ConnectionObserver = Arc<dyn Fn(bool, bool) + Send + Sync>;

/// Returned by observer registration; pass back to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(pub(crate) u64);

pub(crate) struct Shared {
    pub inner: Mutex<Inner>,
    pub gates: Gates,
    pub callbacks: CallbackQueue,
}

pub(crate) struct Inner {
    pub phase: LinkPhase,
    pub registry: DeviceRegistry,
    pub connected: Option<PeripheralDevice>,
    /// Survives disconnects; the reconnect target.
    pub last_connected: Option<PeripheralDevice>,
    pub scan_prefixes: Vec<String>,
    pub scan_callback: Option<ScanCallback>,
    /// A scan was requested while the radio was off; re-issued on power-on.
    pub scan_pending: bool,
    /// Name prefix a running scan-and-connect is waiting to see.
    pub pending_match: Option<String>,
    /// The first device that satisfied `pending_match`.
    pub matched: Option<PeripheralDevice>,
    /// Single read/notify result slot; a new registration replaces it.
    pub read_callback: Option<ReadCallback>,
    /// Single write result slot; a new registration replaces it.
    pub write_callback: Option<WriteCallback>,
    /// Set when the driver reported a discovery failure for the current
    /// cascade phase.
    pub discovery_error: bool,
    pub observers: Vec<(u64, ConnectionObserver)>,
    pub next_observer: u64,
}

impl Shared {
    pub fn new(callbacks: CallbackQueue) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                phase: LinkPhase::Idle,
                registry: DeviceRegistry::new(),
                connected: None,
                last_connected: None,
                scan_prefixes: Vec::new(),
                scan_callback: None,
                scan_pending: false,
                pending_match: None,
                matched: None,
                read_callback: None,
                write_callback: None,
                discovery_error: false,
                observers: Vec::new(),
                next_observer: 0,
            }),
            gates: Gates::default(),
            callbacks,
        })
    }

    /// Posts `(connected, was_connected)` to every observer when the
    /// connected flag genuinely changed. Locks `inner`; the caller must not
    /// hold the guard.
    pub fn notify_observers(&self, was_connected: bool, connected: bool) {
        if was_connected == connected {
            return;
        }
        let observers: Vec<ConnectionObserver> = self
            .inner
            .lock()
            .unwrap()
            .observers
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            self.callbacks
                .post(move || observer(connected, was_connected));
        }
    }
}
