//! BLE Connection Module
//!
//! Single-connection state machine. At most one device is ever connected;
//! every transition is published both as a replayed current value and on a
//! transition log.

use crate::domain::models::{ConnectionState, DeviceId, DeviceRef};
use crate::error::{BleError, Result};
use crate::infrastructure::bluetooth::driver::RadioDriver;
use crate::infrastructure::bluetooth::retry::RetryPolicy;
use crate::infrastructure::bluetooth::scanner::DevicesView;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Total connect attempts before giving up
    pub max_connect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 10,
        }
    }
}

/// Epoch of the attempt sequence currently allowed to publish
#[derive(Default)]
struct Sequence {
    epoch: u64,
    in_flight: Option<CancellationToken>,
}

pub struct ConnectionStateMachine {
    driver: Arc<dyn RadioDriver>,
    devices: DevicesView,
    policy: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    sequence: Mutex<Sequence>,
    connect_flight: tokio::sync::Mutex<()>,
    /// Held while the driver releases a link
    teardown_lock: tokio::sync::Mutex<()>,
}

impl ConnectionStateMachine {
    pub fn new(driver: Arc<dyn RadioDriver>, devices: DevicesView, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        Self {
            driver,
            devices,
            policy: RetryPolicy::immediate(config.max_connect_attempts),
            state,
            transitions,
            sequence: Mutex::new(Sequence::default()),
            connect_flight: tokio::sync::Mutex::new(()),
            teardown_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect to a discovered device. Returns false for an unknown device
    /// or once the retry budget is spent.
    pub async fn connect(&self, id: DeviceId) -> bool {
        self.try_connect(id).await.is_ok()
    }

    /// Like [`ConnectionStateMachine::connect`] but reports why it failed
    pub async fn try_connect(&self, id: DeviceId) -> Result<DeviceRef> {
        let Some(device) = self.devices.get(&id) else {
            warn!(device_id = %id, "Device was not found!");
            return Err(BleError::UnknownDevice(id));
        };

        let _flight = self.connect_flight.lock().await;

        if let Some(current) = self.connected_device() {
            if current.id == device.id {
                debug!(device = %device, "Already connected");
                return Ok(current);
            }
            info!(current = %current, next = %device, "Switching connected device");
            self.disconnect().await;
        }

        // A link still being torn down must be gone before the next one starts
        drop(self.teardown_lock.lock().await);

        let (epoch, cancel) = self.begin_connect();
        info!(device = %device, "Start connecting");

        let driver = self.driver.clone();
        let attempts = self.policy.run("connect", |attempt| {
            let driver = driver.clone();
            let device = device.clone();
            async move {
                debug!(device = %device, attempt, "Connect attempt");
                driver.connect_to_device(&device).await
            }
        });

        let outcome = tokio::select! {
            biased;
            outcome = attempts => outcome,
            _ = cancel.cancelled() => {
                info!(device = %device, "Connect sequence abandoned");
                return Err(BleError::Cancelled);
            }
        };

        match outcome {
            Ok(()) => {
                if self.complete(epoch, ConnectionState::Connected(device.clone())) {
                    info!(device = %device, "Connected!");
                    Ok(device)
                } else {
                    warn!(device = %device, "Connected after the attempt was abandoned, releasing link");
                    if let Err(e) = self.driver.disconnect_device(&device).await {
                        warn!(device = %device, error = %e, "Failed to release abandoned link");
                    }
                    Err(BleError::Cancelled)
                }
            }
            Err(exhausted) => {
                error!(device = %device, attempts = exhausted.attempts, "Giving up connecting");
                self.complete(epoch, ConnectionState::Disconnected);
                Err(exhausted.into())
            }
        }
    }

    /// Drop the current connection.
    ///
    /// "No connected device" is published before the driver tears the link
    /// down. Without a connected device this makes no driver call; an
    /// in-flight connect sequence is abandoned instead.
    pub async fn disconnect(&self) {
        self.release_link(None).await;
    }

    /// Disconnect only while `id` is still the connected device
    pub async fn disconnect_if_current(&self, id: DeviceId) {
        self.release_link(Some(id)).await;
    }

    async fn release_link(&self, expected: Option<DeviceId>) {
        let _teardown = self.teardown_lock.lock().await;

        let (epoch, device) = {
            let mut sequence = self.sequence.lock();
            let current = self.state.borrow().clone();
            match current {
                ConnectionState::Connected(device) => {
                    if expected.is_some_and(|id| id != device.id) {
                        debug!(device = %device, "Connected device changed, keeping it");
                        return;
                    }
                    sequence.epoch += 1;
                    self.publish(ConnectionState::Disconnecting);
                    (sequence.epoch, device)
                }
                ConnectionState::Connecting if expected.is_none() => {
                    sequence.epoch += 1;
                    if let Some(cancel) = sequence.in_flight.take() {
                        cancel.cancel();
                    }
                    self.publish(ConnectionState::Disconnected);
                    return;
                }
                _ => return,
            }
        };

        info!(device = %device, "Start disconnecting");
        let driver = self.driver.clone();
        let result = self
            .policy
            .run("disconnect", |_| {
                let driver = driver.clone();
                let device = device.clone();
                async move { driver.disconnect_device(&device).await }
            })
            .await;

        if let Err(exhausted) = result {
            error!(device = %device, error = %exhausted, "Failed to disconnect cleanly");
        }
        if self.complete(epoch, ConnectionState::Disconnected) {
            info!(device = %device, "Disconnected!");
        }
    }

    /// Abandon any in-flight sequence so nothing publishes after teardown
    pub fn shutdown(&self) {
        let mut sequence = self.sequence.lock();
        sequence.epoch += 1;
        if let Some(cancel) = sequence.in_flight.take() {
            cancel.cancel();
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn connected_device(&self) -> Option<DeviceRef> {
        self.state.borrow().device()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every transition from now on, in order
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub fn observe_state(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.subscribe())
    }

    /// Current connected device (or `None`), then one item per transition.
    ///
    /// Unlike [`ConnectionStateMachine::observe_state`] nothing is coalesced,
    /// so `Connecting` shows up as its own `None`.
    pub fn observe_connected_device(&self) -> BoxStream<'static, Option<DeviceRef>> {
        // Publishing holds the sequence lock, so no transition lands between
        // the snapshot and the subscription
        let (current, transitions) = {
            let _sequence = self.sequence.lock();
            (self.state.borrow().clone(), self.transitions.subscribe())
        };

        let later = BroadcastStream::new(transitions).filter_map(|event| async move {
            match event {
                Ok(state) => Some(state),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connected device observer lagged");
                    None
                }
            }
        });
        stream::once(async move { current })
            .chain(later)
            .map(|state| state.device())
            .boxed()
    }

    fn begin_connect(&self) -> (u64, CancellationToken) {
        let mut sequence = self.sequence.lock();
        sequence.epoch += 1;
        let cancel = CancellationToken::new();
        sequence.in_flight = Some(cancel.clone());
        self.publish(ConnectionState::Connecting);
        (sequence.epoch, cancel)
    }

    /// Publish `state` if `epoch` is still the current sequence
    fn complete(&self, epoch: u64, state: ConnectionState) -> bool {
        let mut sequence = self.sequence.lock();
        if sequence.epoch != epoch {
            return false;
        }
        sequence.in_flight = None;
        self.publish(state);
        true
    }

    /// Caller holds the sequence lock
    fn publish(&self, state: ConnectionState) {
        debug!(state = %state, "Connection state changed");
        self.state.send_replace(state.clone());
        let _ = self.transitions.send(state);
    }
}
