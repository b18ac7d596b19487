//! Central-role BLE client core.
//!
//! This crate bridges an event-driven radio driver into sequential,
//! timeout-bounded operations: scan, connect, discover, read/write/
//! subscribe. All driver events funnel through one dispatcher task; callers
//! suspend on signal gates until the matching event arrives or their
//! deadline passes, and user-facing callbacks are delivered on one dedicated
//! task so consumers need no synchronization of their own.
//!
//! Construct a [`BluetoothManager`] from a [`RadioDriver`] and its event
//! channel ([`BluestDriver`] is the production backend), then compose
//! operations sequentially:
//!
//! ```no_run
//! use ble_central::{BluestDriver, BluetoothManager};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let (driver, events) = BluestDriver::new().await?;
//! let manager = BluetoothManager::new(driver, events);
//!
//! manager.scan(vec!["Pump".into()], |devices| {
//!     for device in &devices {
//!         println!("{} {:?}", device.id(), device.name);
//!     }
//! }).await?;
//! # Ok(())
//! # }
//! ```

mod callbacks;
mod dispatcher;
mod gates;
mod io;
mod state;

pub mod bluest_driver;
pub mod commands;
pub mod constants;
pub mod device;
pub mod driver;
pub mod error;
pub mod manager;
pub mod registry;

pub use bluest_driver::BluestDriver;
pub use commands::{Command, Response};
pub use constants::{DEFAULT_CONNECT_TIMEOUT, DISCOVERY_PHASE_TIMEOUT};
pub use device::{Advertisement, CharacteristicInfo, DeviceId, PeripheralDevice};
pub use driver::{
    DriverEvent, DriverEventReceiver, DriverEventSender, PowerState, RadioDriver, WriteMode,
    event_channel,
};
pub use error::Error;
pub use manager::BluetoothManager;
pub use state::{LinkPhase, ObserverHandle};
