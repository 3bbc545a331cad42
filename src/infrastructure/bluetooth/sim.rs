//! Simulated radio
//!
//! In-memory implementation of [`RadioDriver`] and [`GattAccess`] with
//! knobs for injecting failures and latency. Counts every driver call so
//! callers can assert on exactly what reached the "hardware".

use crate::domain::models::{Device, DeviceId, RadioState, ScanFilter};
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::driver::{Endpoint, GattAccess, GattService, RadioDriver};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;
use uuid::Uuid;

/// Failure budget: number of upcoming calls that fail. `u32::MAX` fails forever.
const ALWAYS: u32 = u32::MAX;

#[derive(Default)]
struct SimState {
    radio_state: RadioState,
    scanning: bool,
    scan_filter: ScanFilter,
    fail_scan_start: bool,
    connect_failures: u32,
    connect_delay: Duration,
    disconnect_delay: Duration,
    connected: HashSet<DeviceId>,
    services: HashMap<(DeviceId, Uuid), Arc<SimService>>,
    service_lookup_failures: u32,
}

#[derive(Default)]
struct CallCounters {
    start_scan: AtomicU32,
    stop_scan: AtomicU32,
    connect: AtomicU32,
    disconnect: AtomicU32,
    service_lookups: AtomicU32,
}

fn take_failure(budget: &mut u32) -> bool {
    match *budget {
        0 => false,
        ALWAYS => true,
        _ => {
            *budget -= 1;
            true
        }
    }
}

pub struct SimulatedRadio {
    state: Mutex<SimState>,
    radio_events: broadcast::Sender<RadioState>,
    discovery_events: broadcast::Sender<Device>,
    calls: CallCounters,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// A powered radio with no devices around
    pub fn new() -> Self {
        Self::with_state(RadioState::On)
    }

    pub fn with_state(radio_state: RadioState) -> Self {
        let (radio_events, _) = broadcast::channel(64);
        let (discovery_events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState {
                radio_state,
                ..Default::default()
            }),
            radio_events,
            discovery_events,
            calls: CallCounters::default(),
        }
    }

    /// Change the radio power state. Losing power drops the scan and every link.
    pub fn set_radio_state(&self, radio_state: RadioState) {
        {
            let mut state = self.state.lock();
            state.radio_state = radio_state;
            if !radio_state.is_usable() {
                state.scanning = false;
                state.connected.clear();
            }
        }
        trace!(?radio_state, "Simulated radio state change");
        let _ = self.radio_events.send(radio_state);
    }

    /// Report a device as discovered. Returns false when the scan would not see it.
    pub fn advertise(&self, device: Device) -> bool {
        let visible = {
            let state = self.state.lock();
            state.scanning && state.radio_state.is_usable() && state.scan_filter.matches(&device)
        };
        if visible {
            let _ = self.discovery_events.send(device);
        }
        visible
    }

    pub fn fail_scan_start(&self, fail: bool) {
        self.state.lock().fail_scan_start = fail;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    pub fn fail_all_connects(&self) {
        self.fail_next_connects(ALWAYS);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.state.lock().disconnect_delay = delay;
    }

    pub fn fail_next_service_lookups(&self, count: u32) {
        self.state.lock().service_lookup_failures = count;
    }

    pub fn fail_all_service_lookups(&self) {
        self.fail_next_service_lookups(ALWAYS);
    }

    /// Expose a GATT service on a device
    pub fn add_service(&self, device_id: DeviceId, service: Uuid) -> Arc<SimService> {
        let sim_service = Arc::new(SimService::new(service));
        self.state
            .lock()
            .services
            .insert((device_id, service), sim_service.clone());
        sim_service
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.state.lock().connected.contains(device_id)
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().connected.len()
    }

    pub fn start_scan_calls(&self) -> u32 {
        self.calls.start_scan.load(Ordering::SeqCst)
    }

    pub fn stop_scan_calls(&self) -> u32 {
        self.calls.stop_scan.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.calls.connect.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.calls.disconnect.load(Ordering::SeqCst)
    }

    pub fn service_lookups(&self) -> u32 {
        self.calls.service_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    fn radio_state(&self) -> RadioState {
        self.state.lock().radio_state
    }

    fn radio_state_changes(&self) -> BoxStream<'static, RadioState> {
        BroadcastStream::new(self.radio_events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    fn discovered_devices(&self) -> BoxStream<'static, Device> {
        BroadcastStream::new(self.discovery_events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        self.calls.start_scan.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if !state.radio_state.is_usable() {
            return Err(BleError::RadioUnavailable);
        }
        if state.fail_scan_start {
            return Err(BleError::ScanFailed("simulated scan start failure".to_string()));
        }
        state.scanning = true;
        state.scan_filter = filter.clone();
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.calls.stop_scan.fetch_add(1, Ordering::SeqCst);
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn connect_to_device(&self, device: &Device) -> Result<()> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if !state.radio_state.is_usable() {
            return Err(BleError::RadioUnavailable);
        }
        if take_failure(&mut state.connect_failures) {
            return Err(BleError::ConnectionFailed(format!(
                "simulated failure connecting to {}",
                device.name
            )));
        }
        state.connected.insert(device.id);
        Ok(())
    }

    async fn disconnect_device(&self, device: &Device) -> Result<()> {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().disconnect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().connected.remove(&device.id);
        Ok(())
    }
}

#[async_trait]
impl GattAccess for SimulatedRadio {
    async fn service(
        &self,
        device: &Device,
        service: Uuid,
    ) -> Result<Option<Arc<dyn GattService>>> {
        self.calls.service_lookups.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if take_failure(&mut state.service_lookup_failures) {
            return Err(BleError::Gatt("simulated service discovery failure".to_string()));
        }
        if !state.connected.contains(&device.id) {
            return Err(BleError::Gatt(format!("{} is not connected", device.name)));
        }
        Ok(state
            .services
            .get(&(device.id, service))
            .cloned()
            .map(|s| s as Arc<dyn GattService>))
    }
}

pub struct SimService {
    id: Uuid,
    characteristics: Mutex<HashMap<Uuid, Arc<SimEndpoint>>>,
}

impl SimService {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            characteristics: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_characteristic(
        &self,
        id: Uuid,
        name: &str,
        value: impl Into<Vec<u8>>,
    ) -> Arc<SimEndpoint> {
        let endpoint = Arc::new(SimEndpoint::new(id, name, value.into()));
        self.characteristics.lock().insert(id, endpoint.clone());
        endpoint
    }
}

#[async_trait]
impl GattService for SimService {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn characteristic(&self, id: Uuid) -> Result<Option<Arc<dyn Endpoint>>> {
        Ok(self
            .characteristics
            .lock()
            .get(&id)
            .cloned()
            .map(|c| c as Arc<dyn Endpoint>))
    }
}

/// Decrements the subscriber count when a notification stream is dropped
struct SubscriptionGuard(Arc<AtomicUsize>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimEndpoint {
    id: Uuid,
    name: String,
    value: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    notifications: broadcast::Sender<Vec<u8>>,
    subscribers: Arc<AtomicUsize>,
}

impl SimEndpoint {
    fn new(id: Uuid, name: &str, value: Vec<u8>) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            id,
            name: name.to_string(),
            value: Mutex::new(value),
            writes: Mutex::new(Vec::new()),
            notifications,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Push a value change to every active subscription
    pub fn notify(&self, value: impl Into<Vec<u8>>) {
        let value = value.into();
        *self.value.lock() = value.clone();
        let _ = self.notifications.send(value);
    }

    /// Number of notification streams currently holding hardware updates on
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl Endpoint for SimEndpoint {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn read(&self) -> Result<Vec<u8>> {
        Ok(self.value.lock().clone())
    }

    async fn write(&self, value: &[u8]) -> Result<()> {
        self.writes.lock().push(value.to_vec());
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        let guard = SubscriptionGuard(self.subscribers.clone());
        let stream = BroadcastStream::new(self.notifications.subscribe()).filter_map(move |event| {
            let _guard = &guard;
            async move { event.ok() }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_budget() {
        let radio = SimulatedRadio::new();
        let device = Device::new(Uuid::new_v4(), "Bike");
        radio.fail_next_connects(2);

        assert!(radio.connect_to_device(&device).await.is_err());
        assert!(radio.connect_to_device(&device).await.is_err());
        assert!(radio.connect_to_device(&device).await.is_ok());
        assert!(radio.is_connected(&device.id));
        assert_eq!(radio.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_power_loss_drops_links_and_scan() {
        let radio = SimulatedRadio::new();
        let device = Device::new(Uuid::new_v4(), "Rower");
        radio.start_scan(&ScanFilter::default()).await.unwrap();
        radio.connect_to_device(&device).await.unwrap();

        radio.set_radio_state(RadioState::Off);

        assert!(!radio.is_scanning());
        assert!(!radio.is_connected(&device.id));
        assert!(radio.start_scan(&ScanFilter::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_notification_subscription_tracking() {
        let service = SimService::new(Uuid::new_v4());
        let endpoint = service.add_characteristic(Uuid::new_v4(), "Data", [0u8]);

        let mut stream = endpoint.notifications().await.unwrap();
        assert_eq!(endpoint.active_subscriptions(), 1);

        endpoint.notify([1u8, 2]);
        assert_eq!(stream.next().await, Some(vec![1, 2]));
        assert_eq!(endpoint.read().await.unwrap(), vec![1, 2]);

        drop(stream);
        assert_eq!(endpoint.active_subscriptions(), 0);
    }
}
