//! Connection Manager
//!
//! Facade that owns the availability monitor, the discovery cache, the
//! connection state machine and the session deriver, and wires them to a
//! single radio driver.

use crate::domain::models::{ConnectionState, DeviceFilter, DeviceId, DeviceRef, ScanFilter};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    availability::RadioAvailabilityMonitor,
    connection::{ConnectionConfig, ConnectionStateMachine},
    driver::{RadioDriver, SessionProvider},
    protocol,
    scanner::{DevicesView, DiscoveryCache},
    session::{CurrentSession, ServiceSessionDeriver, SessionConfig},
};
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};
use uuid::Uuid;

/// Tunables for the whole orchestrator
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    /// Scan filter used by [`ConnectionManager::start_default_scan`]
    pub default_scan_filter: Option<ScanFilter>,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            default_scan_filter: Some(protocol::fitness_machine_scan_filter()),
        }
    }
}

impl From<&Settings> for ConnectionManagerConfig {
    fn from(settings: &Settings) -> Self {
        let default_scan_filter = if settings.show_all_devices {
            None
        } else {
            settings
                .scan_service_filter
                .as_deref()
                .and_then(|uuid| match Uuid::parse_str(uuid) {
                    Ok(uuid) => Some(ScanFilter::services([uuid])),
                    Err(e) => {
                        warn!(uuid, error = %e, "Ignoring invalid scan service filter");
                        None
                    }
                })
        };

        Self {
            connection: ConnectionConfig {
                max_connect_attempts: settings.connect_max_attempts,
            },
            session: SessionConfig {
                max_attempts: settings.session_max_attempts,
                retry_unit: Duration::from_millis(settings.session_retry_unit_ms),
            },
            default_scan_filter,
        }
    }
}

/// Public API of the orchestrator
pub struct ConnectionManager {
    availability: RadioAvailabilityMonitor,
    discovery: DiscoveryCache,
    connection: Arc<ConnectionStateMachine>,
    sessions: ServiceSessionDeriver,
    default_scan_filter: Option<ScanFilter>,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime
    pub fn new(
        driver: Arc<dyn RadioDriver>,
        provider: Arc<dyn SessionProvider>,
        config: ConnectionManagerConfig,
    ) -> Self {
        let availability = RadioAvailabilityMonitor::new(driver.as_ref());
        let discovery = DiscoveryCache::new(driver.clone(), availability.subscribe());
        let connection = Arc::new(ConnectionStateMachine::new(
            driver,
            discovery.devices(),
            config.connection,
        ));
        let sessions = ServiceSessionDeriver::spawn(connection.clone(), provider, config.session);

        info!("Connection manager ready");
        Self {
            availability,
            discovery,
            connection,
            sessions,
            default_scan_filter: config.default_scan_filter,
        }
    }

    /// Replace any running scan. The device cache is cleared first.
    pub fn start_scanning(&self, filter: Option<ScanFilter>, device_filter: Option<DeviceFilter>) {
        self.discovery.start_scanning(filter, device_filter);
    }

    /// Scan with the configured default filter
    pub fn start_default_scan(&self) {
        self.discovery
            .start_scanning(self.default_scan_filter.clone(), None);
    }

    /// Stop scanning. Discovered devices stay cached.
    pub fn stop_scanning(&self) {
        self.discovery.stop_scanning();
    }

    pub fn is_scanning(&self) -> bool {
        self.discovery.is_scanning()
    }

    pub fn devices(&self) -> DevicesView {
        self.discovery.devices()
    }

    pub async fn connect(&self, id: DeviceId) -> bool {
        self.connection.connect(id).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connected_device(&self) -> Option<DeviceRef> {
        self.connection.connected_device()
    }

    pub fn is_radio_available(&self) -> bool {
        self.availability.is_available()
    }

    pub fn observe_radio_availability(&self) -> WatchStream<bool> {
        self.availability.observe()
    }

    pub fn observe_connected_device(&self) -> BoxStream<'static, Option<DeviceRef>> {
        self.connection.observe_connected_device()
    }

    pub fn observe_current_session(&self) -> WatchStream<CurrentSession> {
        self.sessions.observe()
    }

    pub fn current_session(&self) -> CurrentSession {
        self.sessions.current()
    }

    pub fn connection(&self) -> &Arc<ConnectionStateMachine> {
        &self.connection
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.discovery.stop_scanning();
        self.connection.shutdown();
    }
}
