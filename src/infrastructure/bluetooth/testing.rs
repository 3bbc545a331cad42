//! Shared helpers for driving the orchestrator against the simulated radio.

use crate::domain::models::{AdvertisementKind, AdvertisementRecord, Device};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::sim::SimulatedRadio;
use uuid::Uuid;

/// Let spawned tasks run until they block
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Advertise once a hardware scan is running, then let the cache catch up
pub(crate) async fn advertise(radio: &SimulatedRadio, device: Device) {
    for _ in 0..100 {
        if radio.advertise(device.clone()) {
            settle().await;
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("scan never started");
}

/// A fitness machine advertising the FTMS service and its service data
pub(crate) fn fitness_machine(name: &str) -> Device {
    Device::new(Uuid::new_v4(), name)
        .with_rssi(-55)
        .with_services(&[protocol::FITNESS_MACHINE_SERVICE])
        .with_record(AdvertisementRecord::new(
            AdvertisementKind::ServiceData,
            [0x26, 0x18, 0x01, 0x20, 0x00],
        ))
}
