//! Fitness Machine Service Protocol
//!
//! Identifiers of the Bluetooth SIG Fitness Machine Service (FTMS) and the
//! session provider that opens it on a connected device. Message encoding
//! is left to the consumers of the session endpoints.

use crate::domain::models::{AdvertisementKind, Device, ScanFilter};
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::driver::{
    Endpoint, GattAccess, GattService, ProtocolSession, SessionProvider,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Expand a 16-bit SIG-assigned number onto the Bluetooth base UUID
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

pub const FITNESS_MACHINE_SERVICE: Uuid = sig_uuid(0x1826);

pub const FITNESS_MACHINE_FEATURE: Uuid = sig_uuid(0x2ACC);
pub const TREADMILL_DATA: Uuid = sig_uuid(0x2ACD);
pub const CROSS_TRAINER_DATA: Uuid = sig_uuid(0x2ACE);
pub const STEP_CLIMBER_DATA: Uuid = sig_uuid(0x2ACF);
pub const STAIR_CLIMBER_DATA: Uuid = sig_uuid(0x2AD0);
pub const ROWER_DATA: Uuid = sig_uuid(0x2AD1);
pub const INDOOR_BIKE_DATA: Uuid = sig_uuid(0x2AD2);
pub const TRAINING_STATUS: Uuid = sig_uuid(0x2AD3);
pub const SUPPORTED_SPEED_RANGE: Uuid = sig_uuid(0x2AD4);
pub const SUPPORTED_INCLINATION_RANGE: Uuid = sig_uuid(0x2AD5);
pub const SUPPORTED_RESISTANCE_LEVEL_RANGE: Uuid = sig_uuid(0x2AD6);
pub const SUPPORTED_HEART_RATE_RANGE: Uuid = sig_uuid(0x2AD7);
pub const SUPPORTED_POWER_RANGE: Uuid = sig_uuid(0x2AD8);
pub const FITNESS_MACHINE_CONTROL_POINT: Uuid = sig_uuid(0x2AD9);
pub const FITNESS_MACHINE_STATUS: Uuid = sig_uuid(0x2ADA);

const CHARACTERISTIC_NAMES: &[(Uuid, &str)] = &[
    (FITNESS_MACHINE_FEATURE, "Fitness Machine Feature"),
    (TREADMILL_DATA, "Treadmill Data"),
    (CROSS_TRAINER_DATA, "Cross Trainer Data"),
    (STEP_CLIMBER_DATA, "Step Climber Data"),
    (STAIR_CLIMBER_DATA, "Stair Climber Data"),
    (ROWER_DATA, "Rower Data"),
    (INDOOR_BIKE_DATA, "Indoor Bike Data"),
    (TRAINING_STATUS, "Training Status"),
    (SUPPORTED_SPEED_RANGE, "Supported Speed Range"),
    (SUPPORTED_INCLINATION_RANGE, "Supported Inclination Range"),
    (SUPPORTED_RESISTANCE_LEVEL_RANGE, "Supported Resistance Level Range"),
    (SUPPORTED_HEART_RATE_RANGE, "Supported Heart Rate Range"),
    (SUPPORTED_POWER_RANGE, "Supported Power Range"),
    (FITNESS_MACHINE_CONTROL_POINT, "Fitness Machine Control Point"),
    (FITNESS_MACHINE_STATUS, "Fitness Machine Status"),
];

/// Well-known name of an FTMS characteristic
pub fn characteristic_name(id: Uuid) -> &'static str {
    CHARACTERISTIC_NAMES
        .iter()
        .find(|(uuid, _)| *uuid == id)
        .map_or("Unknown", |(_, name)| *name)
}

/// Resolve a characteristic from its well-known name (case-insensitive)
pub fn characteristic_by_name(name: &str) -> Option<Uuid> {
    CHARACTERISTIC_NAMES
        .iter()
        .find(|(_, known)| known.eq_ignore_ascii_case(name))
        .map(|(uuid, _)| *uuid)
}

/// Only report devices advertising the Fitness Machine service
pub fn fitness_machine_scan_filter() -> ScanFilter {
    ScanFilter::services([FITNESS_MACHINE_SERVICE])
}

/// Opens the Fitness Machine service on a connected device.
///
/// The device must have advertised service data during discovery and must
/// expose the FTMS GATT service.
pub struct FtmsSessionProvider {
    gatt: Arc<dyn GattAccess>,
}

impl FtmsSessionProvider {
    pub fn new(gatt: Arc<dyn GattAccess>) -> Self {
        Self { gatt }
    }
}

#[async_trait]
impl SessionProvider for FtmsSessionProvider {
    async fn establish_session(&self, device: &Device) -> Result<Box<dyn ProtocolSession>> {
        let service_data = device
            .record(AdvertisementKind::ServiceData)
            .ok_or(BleError::MissingServiceData)?
            .data
            .clone();

        let service = self
            .gatt
            .service(device, FITNESS_MACHINE_SERVICE)
            .await?
            .ok_or(BleError::ServiceNotFound(FITNESS_MACHINE_SERVICE))?;

        debug!(device = %device, "Fitness machine service opened");
        Ok(Box::new(FtmsSession {
            service_data,
            service,
        }))
    }
}

struct FtmsSession {
    service_data: Vec<u8>,
    service: Arc<dyn GattService>,
}

#[async_trait]
impl ProtocolSession for FtmsSession {
    fn service_data(&self) -> &[u8] {
        &self.service_data
    }

    async fn endpoint(&self, id: Uuid) -> Result<Option<Arc<dyn Endpoint>>> {
        self.service.characteristic(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::driver::RadioDriver;
    use crate::infrastructure::bluetooth::sim::SimulatedRadio;
    use crate::infrastructure::bluetooth::testing::fitness_machine;

    #[test]
    fn test_sig_uuid() {
        assert_eq!(
            FITNESS_MACHINE_SERVICE.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            INDOOR_BIKE_DATA.to_string(),
            "00002ad2-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_characteristic_names() {
        assert_eq!(characteristic_name(ROWER_DATA), "Rower Data");
        assert_eq!(characteristic_name(Uuid::nil()), "Unknown");
        assert_eq!(characteristic_by_name("indoor bike data"), Some(INDOOR_BIKE_DATA));
        assert_eq!(characteristic_by_name("nope"), None);
    }

    #[tokio::test]
    async fn test_session_requires_service_data() {
        let radio = Arc::new(SimulatedRadio::new());
        let provider = FtmsSessionProvider::new(radio.clone());
        let device = Device::new(Uuid::new_v4(), "Plain");

        let err = provider.establish_session(&device).await.err().unwrap();
        assert_eq!(err, BleError::MissingServiceData);
        assert_eq!(radio.service_lookups(), 0);
    }

    #[tokio::test]
    async fn test_session_requires_ftms_service() {
        let radio = Arc::new(SimulatedRadio::new());
        let provider = FtmsSessionProvider::new(radio.clone());
        let device = fitness_machine("Bike");
        radio.connect_to_device(&device).await.unwrap();

        let err = provider.establish_session(&device).await.err().unwrap();
        assert_eq!(err, BleError::ServiceNotFound(FITNESS_MACHINE_SERVICE));
    }

    #[tokio::test]
    async fn test_session_exposes_service_data_and_endpoints() {
        let radio = Arc::new(SimulatedRadio::new());
        let device = fitness_machine("Bike");
        let service = radio.add_service(device.id, FITNESS_MACHINE_SERVICE);
        service.add_characteristic(FITNESS_MACHINE_FEATURE, "Fitness Machine Feature", [0x02]);
        radio.connect_to_device(&device).await.unwrap();

        let provider = FtmsSessionProvider::new(radio.clone());
        let session = provider.establish_session(&device).await.unwrap();

        assert_eq!(session.service_data(), &[0x26, 0x18, 0x01, 0x20, 0x00]);
        let feature = session.endpoint(FITNESS_MACHINE_FEATURE).await.unwrap().unwrap();
        assert_eq!(feature.read().await.unwrap(), vec![0x02]);
        assert!(session.endpoint(ROWER_DATA).await.unwrap().is_none());
    }
}
