use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Stable identity of a peripheral as reported by the radio driver.
pub type DeviceId = Uuid;

/// Kind of an advertisement record observed during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertisementKind {
    Flags,
    CompleteLocalName,
    ShortLocalName,
    ServiceUuids,
    ServiceData,
    ManufacturerData,
    TxPowerLevel,
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub kind: AdvertisementKind,
    pub data: Vec<u8>,
}

impl AdvertisementRecord {
    pub fn new(kind: AdvertisementKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

/// A peripheral snapshot observed during discovery.
///
/// Devices are never mutated in place; re-discovery replaces the cache
/// entry for the same [`DeviceId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub rssi: i16,
    pub advertisement_records: Vec<AdvertisementRecord>,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            name: if name.is_empty() {
                "Unknown".to_string()
            } else {
                name
            },
            rssi: 0,
            advertisement_records: Vec::new(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_record(mut self, record: AdvertisementRecord) -> Self {
        self.advertisement_records.push(record);
        self
    }

    /// Advertise a list of 128-bit service UUIDs (big-endian, as normalised by the driver)
    pub fn with_services(self, services: &[Uuid]) -> Self {
        let data: Vec<u8> = services.iter().flat_map(|s| *s.as_bytes()).collect();
        self.with_record(AdvertisementRecord::new(AdvertisementKind::ServiceUuids, data))
    }

    /// First advertisement record of the given kind, if any
    pub fn record(&self, kind: AdvertisementKind) -> Option<&AdvertisementRecord> {
        self.advertisement_records.iter().find(|r| r.kind == kind)
    }

    pub fn advertised_services(&self) -> Vec<Uuid> {
        self.advertisement_records
            .iter()
            .filter(|r| r.kind == AdvertisementKind::ServiceUuids)
            .flat_map(|r| r.data.chunks_exact(16))
            .filter_map(|chunk| Uuid::from_slice(chunk).ok())
            .collect()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Shared, immutable handle to a discovered device.
pub type DeviceRef = Arc<Device>;

/// Power state of the local radio as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    Unavailable,
    Unauthorized,
    TurningOn,
    On,
    TurningOff,
    Off,
}

impl RadioState {
    /// Only a fully powered radio can scan or connect.
    pub fn is_usable(self) -> bool {
        self == RadioState::On
    }
}

/// Driver-level scan filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report devices advertising at least one of these services.
    /// Empty means no service filtering.
    pub service_uuids: Vec<Uuid>,
}

impl ScanFilter {
    pub fn services(service_uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            service_uuids: service_uuids.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.service_uuids.is_empty()
    }

    pub fn matches(&self, device: &Device) -> bool {
        self.is_empty()
            || device
                .advertised_services()
                .iter()
                .any(|service| self.service_uuids.contains(service))
    }
}

/// Client-side predicate applied to every discovered device.
pub type DeviceFilter = Arc<dyn Fn(&Device) -> bool + Send + Sync>;

/// State of the single managed connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected(DeviceRef),
    Disconnecting,
}

impl ConnectionState {
    /// The connected device; `None` for every state other than `Connected`.
    pub fn device(&self) -> Option<DeviceRef> {
        match self {
            ConnectionState::Connected(device) => Some(device.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected(device) => write!(f, "Connected to {}", device),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}
