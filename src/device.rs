//! Peripheral device representation shared across the crate.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

/// Platform-specific unique identifier of a peripheral (especially important
/// on macOS, where MAC addresses are hidden). Stable for the lifetime of the
/// process; two device records refer to the same peripheral iff their ids
/// match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Best-effort MAC address extraction from the platform id string.
    /// Some platforms embed the address in the id, others do not.
    pub fn mac_address(&self) -> Option<String> {
        static MAC: OnceLock<Regex> = OnceLock::new();
        let re = MAC.get_or_init(|| {
            Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").unwrap()
        });
        re.find_iter(&self.0)
            .last()
            .map(|m| m.as_str().to_uppercase())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Advertisement payload captured at discovery time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Advertisement {
    pub local_name: Option<String>,
    /// Company id and payload, if the advertisement carried manufacturer data.
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
    pub services: Vec<Uuid>,
    pub tx_power: Option<i16>,
    pub is_connectable: bool,
}

/// A characteristic discovered on a connected peripheral, keyed by a string
/// id unique within the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    pub id: String,
    /// The service this characteristic belongs to.
    pub service: Uuid,
    /// Whether change notifications are currently enabled.
    pub notifying: bool,
}

/// A discovered peripheral.
///
/// Identity is immutable once created; transient fields (name, rssi,
/// advertisement) and the discovered service/characteristic sets are updated
/// in place by the event dispatcher. Equality and hashing consider the
/// identifier only.
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralDevice {
    id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertisement: Advertisement,
    /// Services enumerated after a successful connect.
    pub services: Vec<Uuid>,
    /// Characteristics accumulated across all enumerated services.
    pub characteristics: BTreeMap<String, CharacteristicInfo>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) driver_backed: bool,
}

impl PeripheralDevice {
    /// A device record built from a driver discovery event. The driver holds
    /// a live handle for it, so it is eligible for `connect`.
    pub(crate) fn discovered(
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
        advertisement: Advertisement,
    ) -> Self {
        Self {
            id,
            name,
            rssi,
            advertisement,
            services: Vec::new(),
            characteristics: BTreeMap::new(),
            last_seen: Utc::now(),
            driver_backed: true,
        }
    }

    /// A device record with no underlying driver handle, e.g. one rebuilt
    /// from caller-side bookkeeping. `connect` refuses such records.
    pub fn detached(id: impl Into<DeviceId>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi: None,
            advertisement: Advertisement::default(),
            services: Vec::new(),
            characteristics: BTreeMap::new(),
            last_seen: Utc::now(),
            driver_backed: false,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Whether the driver holds a live handle for this device.
    pub fn has_driver_handle(&self) -> bool {
        self.driver_backed
    }

    pub fn characteristic(&self, id: &str) -> Option<&CharacteristicInfo> {
        self.characteristics.get(id)
    }

    /// Applies the scan name filter. An empty filter admits every device; a
    /// non-empty filter admits only named devices whose name contains one of
    /// the prefixes (case-sensitive substring match).
    pub fn name_matches(&self, prefixes: &[String]) -> bool {
        if prefixes.is_empty() {
            return true;
        }
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => {
                prefixes.iter().any(|p| name.contains(p.as_str()))
            }
            _ => false,
        }
    }
}

impl PartialEq for PeripheralDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeripheralDevice {}

impl Hash for PeripheralDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
