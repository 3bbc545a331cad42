//! Collaborator interfaces
//!
//! Everything below this line is provided by the platform: the radio
//! driver (power state, scanning, link-level connect/disconnect) and the
//! GATT layer the protocol session is built on.

use crate::domain::models::{Device, DeviceFilter, RadioState, ScanFilter};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};
use uuid::Uuid;

/// Low-level radio driver
#[async_trait]
pub trait RadioDriver: Send + Sync + 'static {
    /// Current power state of the radio
    fn radio_state(&self) -> RadioState;

    /// Every radio state change from the moment of the call on
    fn radio_state_changes(&self) -> BoxStream<'static, RadioState>;

    /// Device-discovered events from the moment of the call on
    fn discovered_devices(&self) -> BoxStream<'static, Device>;

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;

    async fn connect_to_device(&self, device: &Device) -> Result<()>;
    async fn disconnect_device(&self, device: &Device) -> Result<()>;
}

/// Access to the GATT services of a connected device
#[async_trait]
pub trait GattAccess: Send + Sync + 'static {
    async fn service(&self, device: &Device, service: Uuid)
        -> Result<Option<Arc<dyn GattService>>>;
}

#[async_trait]
pub trait GattService: Send + Sync {
    fn id(&self) -> Uuid;
    async fn characteristic(&self, id: Uuid) -> Result<Option<Arc<dyn Endpoint>>>;
}

/// A single addressable characteristic
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> String;

    async fn read(&self) -> Result<Vec<u8>>;
    async fn write(&self, value: &[u8]) -> Result<()>;

    /// Starts hardware notifications. Dropping the stream stops them.
    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>>;
}

/// Establishes the protocol-level session on top of a raw connection
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    async fn establish_session(&self, device: &Device) -> Result<Box<dyn ProtocolSession>>;
}

#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Service data advertised by the device when it was discovered
    fn service_data(&self) -> &[u8];

    async fn endpoint(&self, id: Uuid) -> Result<Option<Arc<dyn Endpoint>>>;
}

/// Live discovery results for one hardware scan.
///
/// Call [`DiscoveryStream::stop`] to stop the hardware scan in order;
/// dropping the stream without stopping it schedules the stop on the
/// current runtime.
pub struct DiscoveryStream {
    inner: BoxStream<'static, Device>,
    device_filter: Option<DeviceFilter>,
    driver: Option<Arc<dyn RadioDriver>>,
}

impl DiscoveryStream {
    pub async fn stop(mut self) {
        if let Some(driver) = self.driver.take() {
            debug!("Stopping hardware scan");
            if let Err(e) = driver.stop_scan().await {
                warn!(error = %e, "Failed to stop scan");
            }
        }
    }
}

impl Stream for DiscoveryStream {
    type Item = Device;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Device>> {
        let this = self.get_mut();
        loop {
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(device)) => {
                    let accepted = this
                        .device_filter
                        .as_ref()
                        .map_or(true, |filter| filter(&device));
                    if accepted {
                        return Poll::Ready(Some(device));
                    }
                }
                other => return other,
            }
        }
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = driver.stop_scan().await;
                });
            }
        }
    }
}

/// Start a hardware scan and follow its discovery events.
///
/// The event subscription is taken before the scan is started so no
/// early advertisement is lost.
pub async fn scan_for_devices(
    driver: Arc<dyn RadioDriver>,
    filter: &ScanFilter,
    device_filter: Option<DeviceFilter>,
) -> Result<DiscoveryStream> {
    let inner = driver.discovered_devices();
    driver.start_scan(filter).await?;

    Ok(DiscoveryStream {
        inner,
        device_filter,
        driver: Some(driver),
    })
}
