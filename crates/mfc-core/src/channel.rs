//! Global channel numbering across multiple physical handles.
//!
//! Channels are 1-based and contiguous across handles. With `k` channels per
//! handle, channel `n` lives on handle `(n-1) / k` at local channel
//! `n - k * handle`.

use crate::error::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a global channel number lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    /// 0-based index into the driver's handle list
    pub handle_index: usize,
    /// 1-based channel on that handle
    pub local_channel: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMap {
    handles: u16,
    per_handle: u16,
}

impl ChannelMap {
    pub fn new(handles: u16, per_handle: u16) -> Self {
        Self {
            handles,
            per_handle: per_handle.max(1),
        }
    }

    /// One handle carrying every channel (valve banks).
    pub fn single(channels: u16) -> Self {
        Self::new(1, channels)
    }

    pub fn total(&self) -> u16 {
        self.handles.saturating_mul(self.per_handle)
    }

    pub fn per_handle(&self) -> u16 {
        self.per_handle
    }

    pub fn handles(&self) -> u16 {
        self.handles
    }

    pub fn check(&self, channel: u16) -> RigResult<()> {
        if channel == 0 || channel > self.total() {
            return Err(RigError::ChannelOutOfRange {
                channel,
                total: self.total(),
            });
        }
        Ok(())
    }

    pub fn resolve(&self, channel: u16) -> RigResult<ChannelAddress> {
        self.check(channel)?;
        let handle = (channel - 1) / self.per_handle;
        Ok(ChannelAddress {
            handle_index: usize::from(handle),
            local_channel: channel - self.per_handle * handle,
        })
    }

    pub fn channels(&self) -> impl Iterator<Item = u16> {
        1..=self.total()
    }

    /// Expand a target into concrete channel numbers, validating single channels.
    pub fn expand(&self, target: ChannelTarget) -> RigResult<Vec<u16>> {
        match target {
            ChannelTarget::All => Ok(self.channels().collect()),
            ChannelTarget::One(channel) => {
                self.check(channel)?;
                Ok(vec![channel])
            }
        }
    }
}

/// One channel or every channel of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTarget {
    #[default]
    All,
    One(u16),
}

impl ChannelTarget {
    pub fn is_all(self) -> bool {
        matches!(self, Self::All)
    }
}

impl From<u16> for ChannelTarget {
    fn from(channel: u16) -> Self {
        Self::One(channel)
    }
}

impl From<Option<u16>> for ChannelTarget {
    fn from(channel: Option<u16>) -> Self {
        channel.map_or(Self::All, Self::One)
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::One(channel) => write!(f, "{channel}"),
        }
    }
}

impl FromStr for ChannelTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse::<u16>()
            .map(Self::One)
            .map_err(|_| format!("expected a channel number or 'all', got '{s}'"))
    }
}
