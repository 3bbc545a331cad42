//! Radio availability
//!
//! Turns the driver's radio state events into a replayed boolean
//! "radio usable" signal shared by every subscriber.

use crate::infrastructure::bluetooth::driver::RadioDriver;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

pub struct RadioAvailabilityMonitor {
    availability: watch::Receiver<bool>,
    listener: JoinHandle<()>,
}

impl RadioAvailabilityMonitor {
    /// Seed with the current radio state and register a single listener
    /// with the driver. Must be called inside a tokio runtime.
    pub fn new(driver: &dyn RadioDriver) -> Self {
        // Subscribe before sampling so no change slips between the two
        let mut changes = driver.radio_state_changes();
        let initial = driver.radio_state();
        info!(radio_state = ?initial, "Radio availability seeded");

        let (tx, availability) = watch::channel(initial.is_usable());
        let listener = tokio::spawn(async move {
            while let Some(state) = changes.next().await {
                debug!(radio_state = ?state, "Radio state changed");
                tx.send_replace(state.is_usable());
            }
            debug!("Radio state events ended");
        });

        Self {
            availability,
            listener,
        }
    }

    pub fn is_available(&self) -> bool {
        *self.availability.borrow()
    }

    /// Receiver that starts at the latest value
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.availability.clone()
    }

    /// Replays the latest value, then every update. Ends when the monitor is dropped.
    pub fn observe(&self) -> WatchStream<bool> {
        WatchStream::new(self.availability.clone())
    }
}

impl Drop for RadioAvailabilityMonitor {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RadioState;
    use crate::infrastructure::bluetooth::sim::SimulatedRadio;

    #[tokio::test]
    async fn test_seeded_with_current_state() {
        let radio = SimulatedRadio::with_state(RadioState::Off);
        let monitor = RadioAvailabilityMonitor::new(&radio);

        assert!(!monitor.is_available());
        let mut stream = monitor.observe();
        assert_eq!(stream.next().await, Some(false));
    }

    #[tokio::test]
    async fn test_follows_state_changes() {
        let radio = SimulatedRadio::with_state(RadioState::Off);
        let monitor = RadioAvailabilityMonitor::new(&radio);
        let mut availability = monitor.subscribe();

        radio.set_radio_state(RadioState::On);
        availability.changed().await.unwrap();
        assert!(*availability.borrow_and_update());

        radio.set_radio_state(RadioState::TurningOff);
        availability.changed().await.unwrap();
        assert!(!*availability.borrow_and_update());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest_value() {
        let radio = SimulatedRadio::new();
        let monitor = RadioAvailabilityMonitor::new(&radio);
        let mut first = monitor.subscribe();

        radio.set_radio_state(RadioState::Off);
        first.changed().await.unwrap();

        let mut late = monitor.observe();
        assert_eq!(late.next().await, Some(false));
    }

    #[tokio::test]
    async fn test_stream_completes_on_drop() {
        let radio = SimulatedRadio::new();
        let monitor = RadioAvailabilityMonitor::new(&radio);
        let mut stream = monitor.observe();
        assert_eq!(stream.next().await, Some(true));

        drop(monitor);
        assert_eq!(stream.next().await, None);
    }
}
