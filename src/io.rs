//! Characteristic I/O against the currently connected device.
//!
//! Read/notify and write results go through single callback slots: a new
//! registration replaces the previous one, so callers issuing concurrent
//! operations on different characteristics must serialize them. This is a
//! hard API contract, not an accident of the implementation.

use std::sync::Arc;

use log::debug;

use crate::commands::{Command, Response};
use crate::device::{CharacteristicInfo, DeviceId, PeripheralDevice};
use crate::driver::WriteMode;
use crate::error::Error;
use crate::gates::GateKind;
use crate::manager::BluetoothManager;

impl BluetoothManager {
    /// Requests a read of `characteristic` on the connected device. The
    /// value is delivered to `on_result` as `(device, response, success)`.
    pub async fn read_data(
        &self,
        characteristic: &str,
        on_result: impl Fn(PeripheralDevice, Response, bool) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let (id, _) = self.connected_characteristic(characteristic)?;
        self.shared.inner.lock().unwrap().read_callback = Some(Arc::new(on_result));
        debug!("reading {characteristic}");
        self.driver.read_value(&id, characteristic).await?;
        Ok(())
    }

    /// Enables change notifications on `characteristic` and blocks until the
    /// driver acknowledges. Already-notifying characteristics return
    /// immediately with no driver request.
    ///
    /// The acknowledgement wait is unbounded; a driver that never answers
    /// blocks the caller forever.
    pub async fn subscribe(&self, characteristic: &str) -> Result<(), Error> {
        let (id, info) = self.connected_characteristic(characteristic)?;
        if info.notifying {
            debug!("{characteristic} is already notifying");
            return Ok(());
        }
        self.toggle_notifications(&id, characteristic, true).await
    }

    /// Registers `on_result` for incoming values and ensures notifications
    /// are enabled. An already-notifying characteristic is read once
    /// instead, so the caller still gets a value promptly.
    pub async fn subscribe_read(
        &self,
        characteristic: &str,
        on_result: impl Fn(PeripheralDevice, Response, bool) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let (id, info) = self.connected_characteristic(characteristic)?;
        self.shared.inner.lock().unwrap().read_callback = Some(Arc::new(on_result));
        if info.notifying {
            debug!("{characteristic} already notifying, issuing a read");
            self.driver.read_value(&id, characteristic).await?;
            return Ok(());
        }
        self.toggle_notifications(&id, characteristic, true).await
    }

    /// Disables change notifications; no-op when not notifying. Blocks
    /// (unbounded) until the driver acknowledges.
    pub async fn unsubscribe(&self, characteristic: &str) -> Result<(), Error> {
        let (id, info) = self.connected_characteristic(characteristic)?;
        if !info.notifying {
            debug!("{characteristic} is not notifying");
            return Ok(());
        }
        self.toggle_notifications(&id, characteristic, false).await
    }

    /// Writes a command's raw bytes to `characteristic`. Completion is
    /// delivered to `on_result` as `(device, success)`.
    pub async fn write(
        &self,
        command: &Command,
        characteristic: &str,
        mode: WriteMode,
        on_result: impl Fn(PeripheralDevice, bool) + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let (id, _) = self.connected_characteristic(characteristic)?;
        self.shared.inner.lock().unwrap().write_callback = Some(Arc::new(on_result));
        debug!(
            "writing {} bytes to {characteristic} ({mode:?})",
            command.len()
        );
        self.driver
            .write_value(&id, characteristic, command.as_bytes(), mode)
            .await?;
        Ok(())
    }

    async fn toggle_notifications(
        &self,
        id: &DeviceId,
        characteristic: &str,
        enabled: bool,
    ) -> Result<(), Error> {
        let gate = self.shared.gates.arm(GateKind::SubscribeToggle);
        self.driver.set_notify(id, characteristic, enabled).await?;
        gate.wait_unbounded().await;
        Ok(())
    }

    fn connected_characteristic(
        &self,
        characteristic: &str,
    ) -> Result<(DeviceId, CharacteristicInfo), Error> {
        let inner = self.shared.inner.lock().unwrap();
        let device = inner.connected.as_ref().ok_or(Error::NotConnected)?;
        let info = device
            .characteristic(characteristic)
            .cloned()
            .ok_or_else(|| Error::UnknownCharacteristic(characteristic.to_string()))?;
        Ok((device.id().clone(), info))
    }
}
