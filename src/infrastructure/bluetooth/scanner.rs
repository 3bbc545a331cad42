//! BLE Scanner Module
//!
//! Owns the discovery cache: a deduplicated, observable map of the
//! devices seen during the current scan session. Scanning follows radio
//! availability; losing the radio empties the cache until it comes back.

use crate::domain::models::{Device, DeviceFilter, DeviceId, DeviceRef, ScanFilter};
use crate::infrastructure::bluetooth::driver::{scan_for_devices, DiscoveryStream, RadioDriver};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub type DeviceMap = HashMap<DeviceId, DeviceRef>;

/// Cache contents plus the generation of the scan session allowed to write.
#[derive(Debug, Clone, Default)]
struct CacheState {
    generation: u64,
    devices: DeviceMap,
}

/// Shared writer side of the cache. Every write names the generation it
/// belongs to; writes from an older generation are dropped.
#[derive(Clone)]
struct CacheWriter {
    state: Arc<watch::Sender<CacheState>>,
}

impl CacheWriter {
    /// Start a new generation, optionally clearing the cache
    fn next_generation(&self, clear: bool) -> u64 {
        let mut generation = 0;
        self.state.send_if_modified(|state| {
            state.generation += 1;
            generation = state.generation;
            let changed = clear && !state.devices.is_empty();
            if clear {
                state.devices.clear();
            }
            changed
        });
        generation
    }

    fn upsert(&self, generation: u64, device: Device) -> bool {
        self.state.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            state.devices.insert(device.id, Arc::new(device));
            true
        })
    }

    fn clear(&self, generation: u64) {
        self.state.send_if_modified(|state| {
            if state.generation != generation || state.devices.is_empty() {
                return false;
            }
            state.devices.clear();
            true
        });
    }
}

/// Read-only live view of the discovery cache
#[derive(Clone)]
pub struct DevicesView {
    rx: watch::Receiver<CacheState>,
}

impl DevicesView {
    pub fn snapshot(&self) -> DeviceMap {
        self.rx.borrow().devices.clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRef> {
        self.rx.borrow().devices.get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.rx.borrow().devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rx.borrow().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.borrow().devices.is_empty()
    }

    /// Devices sorted by name, for display
    pub fn sorted(&self) -> Vec<DeviceRef> {
        let mut devices: Vec<DeviceRef> = self.rx.borrow().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        devices
    }

    /// Wait for the next change. Returns false once the cache is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Current snapshot first, then one snapshot per change
    pub fn into_stream(self) -> impl Stream<Item = DeviceMap> {
        WatchStream::new(self.rx).map(|state| state.devices)
    }
}

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ScanSlot {
    active: Option<ScanTask>,
    /// Last cancelled pipeline, still shutting its hardware scan down
    stopping: Option<JoinHandle<()>>,
}

/// BLE Scanner maintaining the discovery cache
pub struct DiscoveryCache {
    driver: Arc<dyn RadioDriver>,
    availability: watch::Receiver<bool>,
    writer: CacheWriter,
    view: DevicesView,
    slot: Mutex<ScanSlot>,
}

impl DiscoveryCache {
    pub fn new(driver: Arc<dyn RadioDriver>, availability: watch::Receiver<bool>) -> Self {
        let (tx, rx) = watch::channel(CacheState::default());
        Self {
            driver,
            availability,
            writer: CacheWriter {
                state: Arc::new(tx),
            },
            view: DevicesView { rx },
            slot: Mutex::new(ScanSlot::default()),
        }
    }

    /// Clear the cache and follow discovery for as long as the radio is usable.
    ///
    /// A previous scan session is cancelled first; its hardware scan is
    /// stopped before the new one is started.
    pub fn start_scanning(&self, filter: Option<ScanFilter>, device_filter: Option<DeviceFilter>) {
        let mut slot = self.slot.lock();

        let previous = match slot.active.take() {
            Some(task) => {
                task.cancel.cancel();
                Some(task.handle)
            }
            None => slot.stopping.take(),
        };

        let generation = self.writer.next_generation(true);
        info!(generation, ?filter, "Starting BLE scan");

        let cancel = CancellationToken::new();
        let pipeline = ScanPipeline {
            driver: self.driver.clone(),
            availability: self.availability.clone(),
            writer: self.writer.clone(),
            generation,
            filter: filter.unwrap_or_default(),
            device_filter,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(pipeline.run(previous));

        slot.active = Some(ScanTask { cancel, handle });
    }

    /// Stop the active scan session. The cache keeps its contents.
    pub fn stop_scanning(&self) {
        let mut slot = self.slot.lock();
        if let Some(task) = slot.active.take() {
            info!("Stopping BLE scan...");
            task.cancel.cancel();
            // Late results from the cancelled session must not land
            self.writer.next_generation(false);
            slot.stopping = Some(task.handle);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.slot
            .lock()
            .active
            .as_ref()
            .map_or(false, |task| !task.handle.is_finished())
    }

    pub fn devices(&self) -> DevicesView {
        self.view.clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceRef> {
        self.view.get(id)
    }
}

impl Drop for DiscoveryCache {
    fn drop(&mut self) {
        self.stop_scanning();
        self.writer.next_generation(true);
    }
}

enum FollowOutcome {
    Cancelled,
    Unavailable,
    Ended,
    Failed,
}

struct ScanPipeline {
    driver: Arc<dyn RadioDriver>,
    availability: watch::Receiver<bool>,
    writer: CacheWriter,
    generation: u64,
    filter: ScanFilter,
    device_filter: Option<DeviceFilter>,
    cancel: CancellationToken,
}

impl ScanPipeline {
    async fn run(mut self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        loop {
            let available = *self.availability.borrow_and_update();
            if available {
                match self.follow_discovery().await {
                    FollowOutcome::Cancelled | FollowOutcome::Failed => return,
                    FollowOutcome::Unavailable => continue,
                    FollowOutcome::Ended => {
                        warn!(generation = self.generation, "Discovery stream ended");
                    }
                }
            } else {
                debug!(generation = self.generation, "Radio unavailable, discovery paused");
                self.writer.clear(self.generation);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = self.availability.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn follow_discovery(&mut self) -> FollowOutcome {
        let started = tokio::select! {
            _ = self.cancel.cancelled() => return FollowOutcome::Cancelled,
            started = scan_for_devices(
                self.driver.clone(),
                &self.filter,
                self.device_filter.clone(),
            ) => started,
        };

        let mut stream: DiscoveryStream = match started {
            Ok(stream) => stream,
            Err(e) => {
                error!(generation = self.generation, error = %e, "Failed to start scanning");
                self.writer.clear(self.generation);
                return FollowOutcome::Failed;
            }
        };
        debug!(generation = self.generation, "Discovery started");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break FollowOutcome::Cancelled,
                changed = self.availability.changed() => {
                    if changed.is_err() {
                        break FollowOutcome::Cancelled;
                    }
                    if !*self.availability.borrow_and_update() {
                        info!(generation = self.generation, "Radio became unavailable, clearing devices");
                        self.writer.clear(self.generation);
                        break FollowOutcome::Unavailable;
                    }
                }
                device = stream.next() => match device {
                    Some(device) => {
                        trace!(device = %device, rssi = device.rssi, "Device discovered");
                        self.writer.upsert(self.generation, device);
                    }
                    None => break FollowOutcome::Ended,
                },
            }
        };

        stream.stop().await;
        outcome
    }
}
