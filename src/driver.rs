//! The radio driver abstraction.
//!
//! The coordinator talks to the radio through [`RadioDriver`] and receives
//! every driver-originated event on a channel, which keeps it decoupled from
//! any one backend's callback style. Requests are fire-and-forget: their
//! outcomes arrive later as [`DriverEvent`]s on the driver's event thread.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::device::{Advertisement, CharacteristicInfo, DeviceId};

/// Radio power states as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Delivery mode for characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write; completion is reported by the peripheral.
    WithResponse,
    /// Unacknowledged write; completion means the request left the radio.
    WithoutResponse,
}

/// Everything a driver can report back to the dispatcher.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    PowerChanged(PowerState),
    /// A device was discovered, or a known device's name/metadata changed.
    DeviceDiscovered {
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
        advertisement: Advertisement,
    },
    Connected {
        id: DeviceId,
    },
    /// The link went down, whether or not a disconnect was requested.
    Disconnected {
        id: DeviceId,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<Uuid>,
        ok: bool,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
        ok: bool,
    },
    /// A read result or a notification payload.
    ValueUpdated {
        id: DeviceId,
        characteristic: String,
        value: Vec<u8>,
        ok: bool,
    },
    WriteCompleted {
        id: DeviceId,
        characteristic: String,
        ok: bool,
    },
    /// Acknowledgement of a subscribe/unsubscribe request.
    NotifyStateChanged {
        id: DeviceId,
        characteristic: String,
        enabled: bool,
        ok: bool,
    },
}

pub type DriverEventSender = mpsc::UnboundedSender<DriverEvent>;
pub type DriverEventReceiver = mpsc::UnboundedReceiver<DriverEvent>;

/// The channel a driver reports its events on. The receiving half is handed
/// to [`crate::BluetoothManager::new`].
pub fn event_channel() -> (DriverEventSender, DriverEventReceiver) {
    mpsc::unbounded_channel()
}

/// Interface a radio backend must satisfy.
///
/// Implementations must never block the caller on radio activity: each
/// method issues the request and returns, and the result is delivered as a
/// [`DriverEvent`]. An `Err` return means the request itself could not be
/// issued.
#[async_trait]
pub trait RadioDriver: Send + Sync {
    /// The last power state reported by the radio.
    fn power_state(&self) -> PowerState;

    /// Begins advertising-report delivery (`DeviceDiscovered` events),
    /// optionally restricted to peripherals advertising one of the given
    /// services.
    async fn start_scan(&self, service_filter: &[Uuid]) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Requests a connection; success arrives as `Connected`.
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Tears down (or aborts) a connection; completion arrives as
    /// `Disconnected`.
    async fn cancel_connection(&self, device: &DeviceId) -> Result<()>;

    /// Enumerates services; the result arrives as `ServicesDiscovered`.
    async fn discover_services(&self, device: &DeviceId) -> Result<()>;

    /// Enumerates one service's characteristics; the result arrives as
    /// `CharacteristicsDiscovered`.
    async fn discover_characteristics(&self, device: &DeviceId, service: Uuid) -> Result<()>;

    /// Reads a characteristic; the value arrives as `ValueUpdated`.
    async fn read_value(&self, device: &DeviceId, characteristic: &str) -> Result<()>;

    /// Writes a characteristic; completion arrives as `WriteCompleted`.
    async fn write_value(
        &self,
        device: &DeviceId,
        characteristic: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Enables or disables change notifications; the acknowledgement arrives
    /// as `NotifyStateChanged`.
    async fn set_notify(&self, device: &DeviceId, characteristic: &str, enabled: bool)
        -> Result<()>;
}
