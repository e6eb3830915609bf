//! Last-known device state.
//!
//! Each driver owns one [`SnapshotCell`]. Only the driver's `read_state()`
//! publishes into it; consumers either copy the latest value or subscribe to
//! changes. Publication replaces the whole snapshot, so readers never observe
//! a half-updated channel array.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// XY stage position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Readable state of one device, in canonical units.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceState {
    /// Nothing read yet
    #[default]
    Empty,
    /// Open (`true`) / closed per valve, index 0 is channel 1
    Valves(Vec<bool>),
    /// Millibar per pressure channel, index 0 is channel 1
    Pressure(Vec<f64>),
    Position(Position),
}

impl DeviceState {
    pub fn valves(&self) -> Option<&[bool]> {
        match self {
            Self::Valves(v) => Some(v),
            _ => None,
        }
    }

    pub fn pressure(&self) -> Option<&[f64]> {
        match self {
            Self::Pressure(p) => Some(p),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<Position> {
        match self {
            Self::Position(p) => Some(*p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: DeviceState,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(state: DeviceState) -> Self {
        Self {
            state,
            captured_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(DeviceState::Empty)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Single-writer holder for a driver's published snapshot.
#[derive(Debug)]
pub struct SnapshotCell {
    tx: watch::Sender<Snapshot>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot::empty());
        Self { tx }
    }

    /// Replace the published snapshot and return the new value.
    pub fn publish(&self, state: DeviceState) -> Snapshot {
        let snapshot = Snapshot::new(state);
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    /// Forget the last reading, e.g. after the transport is closed.
    pub fn clear(&self) {
        self.tx.send_replace(Snapshot::empty());
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_state() {
        let cell = SnapshotCell::new();
        let mut rx = cell.subscribe();

        cell.publish(DeviceState::Valves(vec![true, false]));
        rx.changed().await.unwrap();

        assert_eq!(rx.borrow().state.valves(), Some(&[true, false][..]));
        assert_eq!(cell.latest().state, DeviceState::Valves(vec![true, false]));
    }

    #[test]
    fn publish_without_subscribers_still_updates() {
        let cell = SnapshotCell::new();
        cell.publish(DeviceState::Position(Position::new(1.0, 2.0)));
        assert_eq!(cell.latest().state.position(), Some(Position::new(1.0, 2.0)));
        cell.clear();
        assert_eq!(cell.latest().state, DeviceState::Empty);
    }
}
