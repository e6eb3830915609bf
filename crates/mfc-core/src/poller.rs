//! Background state polling.
//!
//! One poller task per driver calls `read_state()` on a fixed interval and
//! republishes the result, optionally through a [`MovingAverage`]. The task
//! checks its stop signal once per iteration; [`PollerHandle::stop`] sends
//! the signal and joins the task so transports are free when it returns.

use crate::capabilities::Driver;
use crate::smoothing::MovingAverage;
use crate::snapshot::{DeviceState, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Moving-average depth for pressure readings; `None` publishes raw values
    pub smoothing: Option<usize>,
}

impl PollerConfig {
    pub fn pressure() -> Self {
        Self {
            interval: Duration::from_millis(300),
            smoothing: Some(3),
        }
    }

    pub fn stage() -> Self {
        Self {
            interval: Duration::from_millis(500),
            smoothing: None,
        }
    }

    pub fn valves() -> Self {
        Self::stage()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::stage()
    }
}

/// Counters returned when a poller is stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub ticks: u64,
    pub failures: u64,
}

pub struct Poller;

impl Poller {
    /// Start polling `driver`. Must be called inside a tokio runtime.
    pub fn spawn(driver: Arc<dyn Driver>, config: PollerConfig) -> PollerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (tx, rx) = watch::channel(driver.snapshot());
        let family = driver.family();

        let span = tracing::info_span!(
            "poller",
            device = %family,
            interval_ms = config.interval.as_millis() as u64
        );
        let task = tokio::spawn(run(driver, config, stop_rx, tx).instrument(span));

        PollerHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
            rx,
        }
    }
}

async fn run(
    driver: Arc<dyn Driver>,
    config: PollerConfig,
    mut stop_rx: oneshot::Receiver<()>,
    tx: watch::Sender<Snapshot>,
) -> PollerStats {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut filter: Option<MovingAverage> = None;
    let mut stats = PollerStats::default();
    let mut failing = false;

    tracing::debug!("poller started");
    loop {
        tokio::select! {
            biased;
            // Fires on an explicit stop and when the handle is dropped
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        stats.ticks += 1;
        match driver.read_state().await {
            Ok(snapshot) => {
                if failing {
                    tracing::info!(failures = stats.failures, "polling recovered");
                    failing = false;
                }
                let published = match (config.smoothing, snapshot.state) {
                    (Some(depth), DeviceState::Pressure(raw)) => {
                        let clipped: Vec<f64> = raw.iter().map(|v| v.max(0.0)).collect();
                        let avg = filter
                            .get_or_insert_with(|| MovingAverage::new(depth, clipped.len()));
                        Snapshot {
                            state: DeviceState::Pressure(avg.push(&clipped)),
                            captured_at: snapshot.captured_at,
                        }
                    }
                    (_, state) => Snapshot {
                        state,
                        captured_at: snapshot.captured_at,
                    },
                };
                tx.send_replace(published);
            }
            Err(e) => {
                stats.failures += 1;
                if !failing {
                    tracing::warn!(error = %e, "poll failed");
                    failing = true;
                }
            }
        }
    }
    tracing::debug!(ticks = stats.ticks, failures = stats.failures, "poller stopped");
    stats
}

/// Owner of a running poller. Dropping it stops the loop at its next iteration.
pub struct PollerHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<PollerStats>>,
    rx: watch::Receiver<Snapshot>,
}

impl PollerHandle {
    /// Receiver of the published (possibly smoothed) snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.rx.clone()
    }

    pub fn latest(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) -> PollerStats {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "poller task failed");
                PollerStats::default()
            }),
            None => PollerStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Setpoint;
    use crate::channel::ChannelTarget;
    use crate::driver::DriverFamily;
    use crate::error::{RigError, RigResult};
    use crate::snapshot::SnapshotCell;
    use crate::units::{PressureUnit, Unit};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Driver that replays scripted readings, then repeats the last one.
    struct ScriptedDriver {
        readings: Mutex<VecDeque<RigResult<Vec<f64>>>>,
        last: Mutex<Vec<f64>>,
        cell: SnapshotCell,
        closed: AtomicBool,
    }

    impl ScriptedDriver {
        fn new(readings: Vec<RigResult<Vec<f64>>>) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings.into()),
                last: Mutex::new(vec![0.0]),
                cell: SnapshotCell::new(),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        fn family(&self) -> DriverFamily {
            DriverFamily::MockFlow
        }

        async fn connect(&self) -> RigResult<Unit> {
            Ok(Unit::Pressure(PressureUnit::Millibar))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        async fn read_state(&self) -> RigResult<Snapshot> {
            let next = self.readings.lock().pop_front();
            let values = match next {
                Some(Ok(values)) => {
                    *self.last.lock() = values.clone();
                    values
                }
                Some(Err(e)) => return Err(e),
                None => self.last.lock().clone(),
            };
            Ok(self.cell.publish(DeviceState::Pressure(values)))
        }

        async fn apply(&self, _target: ChannelTarget, setpoint: Setpoint) -> RigResult<()> {
            Err(setpoint.unsupported(self.family()))
        }

        fn snapshot(&self) -> Snapshot {
            self.cell.latest()
        }

        fn subscribe(&self) -> watch::Receiver<Snapshot> {
            self.cell.subscribe()
        }

        fn unit(&self) -> Unit {
            Unit::Pressure(PressureUnit::Millibar)
        }

        fn set_unit(&self, _unit: Unit) -> RigResult<()> {
            Ok(())
        }
    }

    // Long enough that a subscriber reads one publication before the next
    fn fast(smoothing: Option<usize>) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(100),
            smoothing,
        }
    }

    #[tokio::test]
    async fn first_smoothed_value_includes_seed_zeros() {
        let driver = ScriptedDriver::new(vec![Ok(vec![9.0])]);
        let handle = Poller::spawn(driver, fast(Some(3)));
        let mut rx = handle.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, DeviceState::Pressure(vec![3.0]));

        let stats = handle.stop().await;
        assert!(stats.ticks >= 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn negative_readings_are_clipped_before_averaging() {
        let driver = ScriptedDriver::new(vec![Ok(vec![-6.0, 6.0])]);
        let handle = Poller::spawn(driver, fast(Some(3)));
        let mut rx = handle.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, DeviceState::Pressure(vec![0.0, 2.0]));
        handle.stop().await;
    }

    #[tokio::test]
    async fn raw_values_published_without_smoothing() {
        let driver = ScriptedDriver::new(vec![Ok(vec![9.0])]);
        let handle = Poller::spawn(driver, fast(None));
        let mut rx = handle.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, DeviceState::Pressure(vec![9.0]));
        handle.stop().await;
    }

    #[tokio::test]
    async fn failures_are_counted_and_polling_continues() {
        let driver = ScriptedDriver::new(vec![
            Err(RigError::command(DriverFamily::MockFlow, "timeout")),
            Err(RigError::command(DriverFamily::MockFlow, "timeout")),
            Ok(vec![1.0]),
        ]);
        let handle = Poller::spawn(driver, fast(None));
        let mut rx = handle.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, DeviceState::Pressure(vec![1.0]));

        let stats = handle.stop().await;
        assert_eq!(stats.failures, 2);
        assert!(stats.ticks >= 3);
    }

    #[tokio::test]
    async fn stop_joins_the_task() {
        let driver = ScriptedDriver::new(vec![]);
        let handle = Poller::spawn(driver.clone(), fast(None));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        handle.stop().await;
        // Only the test's own reference remains once the task is gone
        assert_eq!(Arc::strong_count(&driver), 1);
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_polling() {
        let driver = ScriptedDriver::new(vec![]);
        let handle = Poller::spawn(driver.clone(), fast(None));
        drop(handle);

        for _ in 0..50 {
            if Arc::strong_count(&driver) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("poller still holds the driver after its handle was dropped");
    }
}
