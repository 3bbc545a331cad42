//! Service session
//!
//! Derives the protocol session from the connected device. Establishment is
//! retried with a growing delay; once the budget is spent the device is
//! disconnected and no session is reported.

use crate::domain::models::DeviceRef;
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use crate::infrastructure::bluetooth::driver::{Endpoint, ProtocolSession, SessionProvider};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::retry::RetryPolicy;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// An established protocol session on the connected device.
///
/// Owns every notification subscription opened through its endpoints and
/// ends them when the session is released or dropped.
pub struct ServiceSession {
    device: DeviceRef,
    inner: Box<dyn ProtocolSession>,
    released: CancellationToken,
}

impl ServiceSession {
    pub fn new(device: DeviceRef, inner: Box<dyn ProtocolSession>) -> Self {
        Self {
            device,
            inner,
            released: CancellationToken::new(),
        }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn service_data(&self) -> &[u8] {
        self.inner.service_data()
    }

    /// Look up an endpoint by its protocol identifier
    pub async fn endpoint(&self, id: Uuid) -> Result<Option<SessionEndpoint>> {
        if self.is_released() {
            return Err(BleError::Cancelled);
        }

        let Some(endpoint) = self.inner.endpoint(id).await? else {
            warn!(
                characteristic = protocol::characteristic_name(id),
                characteristic_id = %id,
                "Failed to get characteristic from FTMS service"
            );
            return Ok(None);
        };

        trace!(
            characteristic = %endpoint.name(),
            characteristic_id = %id,
            "Got characteristic from FTMS service"
        );
        Ok(Some(SessionEndpoint {
            inner: endpoint,
            released: self.released.clone(),
        }))
    }

    /// End every notification subscription and refuse further I/O
    pub fn release(&self) {
        if !self.released.is_cancelled() {
            debug!(device = %self.device, "Releasing service session");
            self.released.cancel();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }
}

impl Drop for ServiceSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Endpoint handle scoped to the session it came from
#[derive(Clone)]
pub struct SessionEndpoint {
    inner: Arc<dyn Endpoint>,
    released: CancellationToken,
}

impl SessionEndpoint {
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub fn name(&self) -> String {
        self.inner.name()
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        if self.released.is_cancelled() {
            return Err(BleError::Cancelled);
        }
        let value = self.inner.read().await?;
        trace!(characteristic = %self.name(), characteristic_id = %self.id(), "Characteristic was read");
        Ok(value)
    }

    pub async fn write(&self, value: &[u8]) -> Result<()> {
        if self.released.is_cancelled() {
            return Err(BleError::Cancelled);
        }
        self.inner.write(value).await?;
        trace!(
            characteristic = %self.name(),
            characteristic_id = %self.id(),
            len = value.len(),
            "Characteristic was written"
        );
        Ok(())
    }

    /// Value-change notifications. The stream ends when the session is
    /// released; dropping it stops hardware notifications.
    pub async fn observe_notifications(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        if self.released.is_cancelled() {
            return Err(BleError::Cancelled);
        }
        let name = self.name();
        let id = self.id();
        trace!(characteristic = %name, characteristic_id = %id, "Characteristic will be observed");

        let stream = self
            .inner
            .notifications()
            .await?
            .inspect(move |_| {
                trace!(characteristic = %name, characteristic_id = %id, "Characteristic was notified")
            })
            .take_until(self.released.clone().cancelled_owned());
        Ok(stream.boxed())
    }
}

pub type CurrentSession = Option<Arc<ServiceSession>>;

/// Configuration for session establishment
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_attempts: u32,
    /// Retry `i` waits `i × retry_unit`
    pub retry_unit: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_unit: std::time::Duration::from_secs(1),
        }
    }
}

pub struct ServiceSessionDeriver {
    current: watch::Receiver<CurrentSession>,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceSessionDeriver {
    /// Start following the connection state machine
    pub fn spawn(
        connection: Arc<ConnectionStateMachine>,
        provider: Arc<dyn SessionProvider>,
        config: SessionConfig,
    ) -> Self {
        let (tx, current) = watch::channel(None);
        let closed = CancellationToken::new();
        let publisher = SessionPublisher {
            tx,
            closed: closed.clone(),
        };
        let policy = RetryPolicy::linear(config.max_attempts, config.retry_unit);
        let task = tokio::spawn(derive_sessions(connection, provider, policy, publisher));
        Self {
            current,
            closed,
            task,
        }
    }

    pub fn current(&self) -> CurrentSession {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CurrentSession> {
        self.current.clone()
    }

    /// Replays the current session (or `None`), then every change
    pub fn observe(&self) -> WatchStream<CurrentSession> {
        WatchStream::new(self.current.clone())
    }
}

impl Drop for ServiceSessionDeriver {
    fn drop(&mut self) {
        // Receivers may outlive the task; the session they hold must not
        self.closed.cancel();
        self.task.abort();
        if let Some(session) = self.current.borrow().as_ref() {
            session.release();
        }
    }
}

struct SessionPublisher {
    tx: watch::Sender<CurrentSession>,
    closed: CancellationToken,
}

impl SessionPublisher {
    /// Replace the published session, releasing the one it replaces.
    /// Once the deriver is closed every session is released on arrival.
    fn publish(&self, next: CurrentSession) {
        self.tx.send_if_modified(|current| {
            if self.closed.is_cancelled() {
                if let Some(next) = &next {
                    next.release();
                }
            }
            let changed = current.is_some() || next.is_some();
            if let Some(previous) = std::mem::replace(current, next) {
                previous.release();
            }
            changed
        });
    }
}

async fn derive_sessions(
    connection: Arc<ConnectionStateMachine>,
    provider: Arc<dyn SessionProvider>,
    policy: RetryPolicy,
    publisher: SessionPublisher,
) {
    let mut states = connection.subscribe();

    loop {
        let device = states.borrow_and_update().device();
        publisher.publish(None);

        if let Some(device) = device {
            info!(device = %device, "Establishing service session");
            let establish = policy.run_or_else(
                "establish session",
                |attempt| {
                    let provider = provider.clone();
                    let device = device.clone();
                    async move {
                        debug!(device = %device, attempt, "Session attempt");
                        provider.establish_session(&device).await
                    }
                },
                |exhausted| {
                    error!(
                        device = %device,
                        error = %exhausted,
                        "Could not establish service session, disconnecting"
                    );
                    // Detached: the state change it publishes must not cancel it
                    let connection = connection.clone();
                    let failed = device.id;
                    tokio::spawn(async move { connection.disconnect_if_current(failed).await });
                    async {}
                },
            );

            tokio::select! {
                biased;
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(device = %device, "Connection changed, abandoning session attempt");
                    continue;
                }
                inner = establish => {
                    if let Some(inner) = inner {
                        info!(device = %device, "Service session established");
                        publisher.publish(Some(Arc::new(ServiceSession::new(device, inner))));
                    }
                }
            }
        }

        if states.changed().await.is_err() {
            break;
        }
    }

    publisher.publish(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionState, Device, RadioState};
    use crate::infrastructure::bluetooth::availability::RadioAvailabilityMonitor;
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::protocol::{
        FtmsSessionProvider, FITNESS_MACHINE_SERVICE, INDOOR_BIKE_DATA,
    };
    use crate::infrastructure::bluetooth::scanner::DiscoveryCache;
    use crate::infrastructure::bluetooth::sim::{SimEndpoint, SimulatedRadio};
    use crate::infrastructure::bluetooth::testing::{advertise, fitness_machine, settle};
    use crate::domain::models::DeviceId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Fixture {
        radio: Arc<SimulatedRadio>,
        _monitor: RadioAvailabilityMonitor,
        _cache: DiscoveryCache,
        machine: Arc<ConnectionStateMachine>,
        deriver: ServiceSessionDeriver,
        bike: Device,
        bike_data: Arc<SimEndpoint>,
    }

    async fn fixture() -> Fixture {
        let radio = Arc::new(SimulatedRadio::with_state(RadioState::On));
        let monitor = RadioAvailabilityMonitor::new(radio.as_ref());
        let cache = DiscoveryCache::new(radio.clone(), monitor.subscribe());
        cache.start_scanning(None, None);

        let bike = fitness_machine("Bike");
        let service = radio.add_service(bike.id, FITNESS_MACHINE_SERVICE);
        let bike_data = service.add_characteristic(INDOOR_BIKE_DATA, "Indoor Bike Data", [0u8; 4]);
        advertise(&radio, bike.clone()).await;

        let machine = Arc::new(ConnectionStateMachine::new(
            radio.clone(),
            cache.devices(),
            ConnectionConfig::default(),
        ));
        let deriver = ServiceSessionDeriver::spawn(
            machine.clone(),
            Arc::new(FtmsSessionProvider::new(radio.clone())),
            SessionConfig::default(),
        );

        Fixture {
            radio,
            _monitor: monitor,
            _cache: cache,
            machine,
            deriver,
            bike,
            bike_data,
        }
    }

    async fn next_session(rx: &mut watch::Receiver<CurrentSession>) -> CurrentSession {
        rx.changed().await.unwrap();
        rx.borrow_and_update().clone()
    }

    #[tokio::test]
    async fn test_no_session_before_connect() {
        let f = fixture().await;
        let mut stream = f.deriver.observe();
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(f.radio.service_lookups(), 0);
    }

    #[tokio::test]
    async fn test_session_follows_connection() {
        let f = fixture().await;
        let mut sessions = f.deriver.subscribe();

        assert!(f.machine.connect(f.bike.id).await);
        let session = next_session(&mut sessions).await.unwrap();
        assert_eq!(session.device().id, f.bike.id);
        assert_eq!(session.service_data(), &[0x26, 0x18, 0x01, 0x20, 0x00]);

        f.machine.disconnect().await;
        assert!(next_session(&mut sessions).await.is_none());
        assert!(session.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let f = fixture().await;
        f.radio.fail_next_service_lookups(3);
        let mut sessions = f.deriver.subscribe();

        assert!(f.machine.connect(f.bike.id).await);
        let session = next_session(&mut sessions).await;

        assert!(session.is_some());
        assert_eq!(f.radio.service_lookups(), 4);
        assert!(f.machine.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_force_one_disconnect() {
        let f = fixture().await;
        f.radio.fail_all_service_lookups();
        let mut transitions = f.machine.transitions();

        let start = Instant::now();
        assert!(f.machine.connect(f.bike.id).await);

        let mut states = f.machine.subscribe();
        while states.borrow_and_update().clone() != ConnectionState::Disconnected {
            states.changed().await.unwrap();
        }
        settle().await;

        assert_eq!(f.radio.service_lookups(), 10);
        assert_eq!(f.radio.disconnect_calls(), 1);
        assert!(f.deriver.current().is_none());
        // 1 + 2 + ... + 9 seconds of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(45));

        let mut seen = Vec::new();
        while let Ok(state) = transitions.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen.last(),
            Some(&ConnectionState::Disconnected),
            "forced disconnect must end disconnected"
        );
        assert_eq!(
            seen.iter().filter(|s| **s == ConnectionState::Disconnecting).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_pending_attempts() {
        let f = fixture().await;
        f.radio.fail_all_service_lookups();

        assert!(f.machine.connect(f.bike.id).await);
        // Let the first attempts fail, leaving a backoff timer pending
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let before = f.radio.service_lookups();
        assert!(before > 0 && before < 10);

        f.machine.disconnect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(f.radio.service_lookups(), before);
        assert_eq!(f.radio.disconnect_calls(), 1);
        assert!(f.deriver.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_restarts_on_next_connection() {
        let f = fixture().await;
        f.radio.fail_all_service_lookups();

        assert!(f.machine.connect(f.bike.id).await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.radio.service_lookups(), 10);
        assert_eq!(f.machine.state(), ConnectionState::Disconnected);

        f.radio.fail_next_service_lookups(0);
        let mut sessions = f.deriver.subscribe();
        assert!(f.machine.connect(f.bike.id).await);
        assert!(next_session(&mut sessions).await.is_some());
        assert_eq!(f.radio.service_lookups(), 11);
    }

    #[tokio::test]
    async fn test_release_ends_notification_streams() {
        let f = fixture().await;
        let mut sessions = f.deriver.subscribe();
        assert!(f.machine.connect(f.bike.id).await);
        let session = next_session(&mut sessions).await.unwrap();

        let endpoint = session.endpoint(INDOOR_BIKE_DATA).await.unwrap().unwrap();
        let mut notifications = endpoint.observe_notifications().await.unwrap();
        assert_eq!(f.bike_data.active_subscriptions(), 1);

        f.bike_data.notify([1u8, 2, 3, 4]);
        assert_eq!(notifications.next().await, Some(vec![1, 2, 3, 4]));

        f.machine.disconnect().await;
        assert!(next_session(&mut sessions).await.is_none());

        assert_eq!(notifications.next().await, None);
        drop(notifications);
        assert_eq!(f.bike_data.active_subscriptions(), 0);
        assert_eq!(endpoint.read().await.unwrap_err(), BleError::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_none() {
        let f = fixture().await;
        let mut sessions = f.deriver.subscribe();
        assert!(f.machine.connect(f.bike.id).await);
        let session = next_session(&mut sessions).await.unwrap();

        let missing = session.endpoint(protocol::ROWER_DATA).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_endpoint_write_reaches_device() {
        let f = fixture().await;
        let mut sessions = f.deriver.subscribe();
        assert!(f.machine.connect(f.bike.id).await);
        let session = next_session(&mut sessions).await.unwrap();

        let endpoint = session.endpoint(INDOOR_BIKE_DATA).await.unwrap().unwrap();
        endpoint.write(&[0x00]).await.unwrap();
        assert_eq!(f.bike_data.written(), vec![vec![0x00]]);
    }

    /// Rejects the first handshake, but only after moving the connection
    /// over to another device
    struct SwitchThenReject {
        machine: Arc<ConnectionStateMachine>,
        next: DeviceId,
        switched: AtomicBool,
        inner: FtmsSessionProvider,
    }

    #[async_trait]
    impl SessionProvider for SwitchThenReject {
        async fn establish_session(&self, device: &Device) -> Result<Box<dyn ProtocolSession>> {
            if !self.switched.swap(true, Ordering::SeqCst) {
                self.machine.disconnect().await;
                assert!(self.machine.connect(self.next).await);
                return Err(BleError::Gatt("handshake rejected".to_string()));
            }
            self.inner.establish_session(device).await
        }
    }

    #[tokio::test]
    async fn test_forced_disconnect_spares_newer_connection() {
        let radio = Arc::new(SimulatedRadio::with_state(RadioState::On));
        let monitor = RadioAvailabilityMonitor::new(radio.as_ref());
        let cache = DiscoveryCache::new(radio.clone(), monitor.subscribe());
        cache.start_scanning(None, None);

        let first = fitness_machine("Bike A");
        let second = fitness_machine("Bike B");
        radio.add_service(second.id, FITNESS_MACHINE_SERVICE);
        advertise(&radio, first.clone()).await;
        advertise(&radio, second.clone()).await;

        let machine = Arc::new(ConnectionStateMachine::new(
            radio.clone(),
            cache.devices(),
            ConnectionConfig::default(),
        ));
        let provider = SwitchThenReject {
            machine: machine.clone(),
            next: second.id,
            switched: AtomicBool::new(false),
            inner: FtmsSessionProvider::new(radio.clone()),
        };
        let deriver = ServiceSessionDeriver::spawn(
            machine.clone(),
            Arc::new(provider),
            SessionConfig {
                max_attempts: 1,
                retry_unit: Duration::from_secs(1),
            },
        );
        let mut sessions = deriver.subscribe();

        assert!(machine.connect(first.id).await);
        let session = next_session(&mut sessions).await.unwrap();
        settle().await;

        assert_eq!(session.device().id, second.id);
        assert_eq!(machine.connected_device().unwrap().id, second.id);
        assert!(radio.is_connected(&second.id));
        assert_eq!(radio.disconnect_calls(), 1);
        assert!(!session.is_released());
    }
}
