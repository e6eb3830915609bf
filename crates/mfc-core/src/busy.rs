//! Bounded busy-wait.
//!
//! Serial and motion controllers report "busy" while a move or command is in
//! progress. [`BusyPolicy::wait_while_busy`] polls a status probe at a fixed
//! interval until it reports ready, and gives up with
//! [`RigError::BusyTimeout`] once the bound is exceeded. A single notice is
//! logged per wait episode regardless of how many polls it takes.

use crate::driver::DriverFamily;
use crate::error::{RigError, RigResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyPolicy {
    /// Sleep between status queries
    pub interval: Duration,
    /// Give up after this long
    pub bound: Duration,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            bound: Duration::from_secs(10),
        }
    }
}

impl BusyPolicy {
    pub fn new(interval: Duration, bound: Duration) -> Self {
        Self { interval, bound }
    }

    /// Policy for waiting out physical motion, which can take minutes.
    pub fn motion() -> Self {
        Self {
            interval: Duration::from_millis(200),
            bound: Duration::from_secs(120),
        }
    }

    /// Poll `probe` until it returns `Ok(false)`.
    ///
    /// `probe` returns `Ok(true)` while busy. Probe errors abort the wait.
    pub async fn wait_while_busy<F, Fut>(
        &self,
        family: DriverFamily,
        what: &str,
        mut probe: F,
    ) -> RigResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RigResult<bool>>,
    {
        let start = Instant::now();
        let mut announced = false;

        while probe().await? {
            let waited = start.elapsed();
            if waited >= self.bound {
                tracing::warn!(
                    device = %family,
                    waited_ms = waited.as_millis() as u64,
                    "{what}: gave up waiting for device"
                );
                return Err(RigError::BusyTimeout { family, waited });
            }
            if !announced {
                tracing::info!(device = %family, "{what}: device busy, waiting");
                announced = true;
            }
            tokio::time::sleep(self.interval).await;
        }

        if announced {
            tracing::debug!(
                device = %family,
                waited_ms = start.elapsed().as_millis() as u64,
                "{what}: device ready"
            );
        }
        Ok(())
    }
}
