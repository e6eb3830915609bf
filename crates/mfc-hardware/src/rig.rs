//! Rig bring-up and teardown.
//!
//! A [`Rig`] owns one device per configured subsystem. Bring-up never fails
//! as a whole: a subsystem whose driver cannot be resolved, built or
//! connected is marked [`SubsystemStatus::Disabled`] and the rest carry on.

use mfc_core::capabilities::{Driver, PressureControl, StageControl, ValveControl};
use mfc_core::driver::{DeviceComponents, DriverFamily};
use mfc_core::error::RigResult;
use mfc_core::poller::{Poller, PollerConfig, PollerHandle, PollerStats};
use mfc_core::snapshot::Snapshot;
use mfc_core::units::Unit;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{HardwareConfig, Role, SubsystemConfig};
use crate::registry::DriverRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemStatus {
    Ready,
    /// Configured but unusable; controls for it are not handed out
    Disabled { reason: String },
    NotConfigured,
}

impl SubsystemStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for SubsystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Disabled { reason } => write!(f, "disabled: {reason}"),
            Self::NotConfigured => f.write_str("not configured"),
        }
    }
}

struct Subsystem {
    family: Option<DriverFamily>,
    status: SubsystemStatus,
    components: Option<DeviceComponents>,
    poll: PollerConfig,
    unit: Option<Unit>,
    poller: Option<PollerHandle>,
}

impl Subsystem {
    fn not_configured() -> Self {
        Self {
            family: None,
            status: SubsystemStatus::NotConfigured,
            components: None,
            poll: PollerConfig::default(),
            unit: None,
            poller: None,
        }
    }

    fn disabled(family: Option<DriverFamily>, reason: String) -> Self {
        Self {
            family,
            status: SubsystemStatus::Disabled { reason },
            ..Self::not_configured()
        }
    }

    fn ready(&self) -> Option<&DeviceComponents> {
        match self.status {
            SubsystemStatus::Ready => self.components.as_ref(),
            _ => None,
        }
    }
}

/// Per-subsystem summary for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemReport {
    pub role: Role,
    pub family: Option<DriverFamily>,
    pub status: SubsystemStatus,
    pub unit: Option<Unit>,
    pub polling: bool,
}

/// The connected rig.
pub struct Rig {
    subsystems: BTreeMap<Role, Subsystem>,
}

impl Rig {
    /// Build and connect every configured subsystem.
    pub async fn bring_up(config: &HardwareConfig, registry: &DriverRegistry) -> Self {
        let mut subsystems = BTreeMap::new();
        for role in Role::ALL {
            let subsystem = match config.subsystem(role) {
                Some(sub) => Self::bring_up_one(role, sub, registry).await,
                None => {
                    info!(subsystem = %role, "not configured");
                    Subsystem::not_configured()
                }
            };
            subsystems.insert(role, subsystem);
        }
        Self { subsystems }
    }

    async fn bring_up_one(
        role: Role,
        config: &SubsystemConfig,
        registry: &DriverRegistry,
    ) -> Subsystem {
        let family = config.hardware.parse::<DriverFamily>().ok();
        let built = match registry.build(&config.hardware, config.config.clone()).await {
            Ok(built) => built,
            Err(e) => {
                warn!(subsystem = %role, hardware = %config.hardware, error = %e, "subsystem disabled");
                return Subsystem::disabled(family, e.to_string());
            }
        };

        let mut poll = built.poll;
        if let Some(interval) = config.poll_interval() {
            poll = poll.with_interval(interval);
        }

        match built.components.driver.connect().await {
            Ok(unit) => {
                info!(subsystem = %role, hardware = %config.hardware, %unit, "subsystem ready");
                Subsystem {
                    family,
                    status: SubsystemStatus::Ready,
                    components: Some(built.components),
                    poll,
                    unit: Some(unit),
                    poller: None,
                }
            }
            Err(e) => {
                warn!(subsystem = %role, hardware = %config.hardware, error = %e, "subsystem disabled");
                Subsystem::disabled(family, e.to_string())
            }
        }
    }

    pub fn status(&self, role: Role) -> SubsystemStatus {
        self.subsystems
            .get(&role)
            .map_or(SubsystemStatus::NotConfigured, |s| s.status.clone())
    }

    pub fn report(&self) -> Vec<SubsystemReport> {
        self.subsystems
            .iter()
            .map(|(role, sub)| SubsystemReport {
                role: *role,
                family: sub.family,
                status: sub.status.clone(),
                unit: sub.unit,
                polling: sub.poller.as_ref().is_some_and(|p| !p.is_finished()),
            })
            .collect()
    }

    pub fn driver(&self, role: Role) -> Option<Arc<dyn Driver>> {
        self.subsystems
            .get(&role)?
            .ready()
            .map(|c| c.driver.clone())
    }

    /// Valve controls, if the valving subsystem is ready.
    pub fn valves(&self) -> Option<Arc<dyn ValveControl>> {
        self.subsystems.get(&Role::Valving)?.ready()?.valves.clone()
    }

    /// Pressure controls, if the flowing subsystem is ready.
    pub fn pressure(&self) -> Option<Arc<dyn PressureControl>> {
        self.subsystems.get(&Role::Flowing)?.ready()?.pressure.clone()
    }

    /// Stage controls, if the collecting subsystem is ready.
    pub fn stage(&self) -> Option<Arc<dyn StageControl>> {
        self.subsystems.get(&Role::Collecting)?.ready()?.stage.clone()
    }

    /// Read every ready subsystem once, without the pollers.
    pub async fn read_all(&self) -> Vec<(Role, RigResult<Snapshot>)> {
        let mut readings = Vec::new();
        for (role, sub) in &self.subsystems {
            if let Some(components) = sub.ready() {
                readings.push((*role, components.driver.read_state().await));
            }
        }
        readings
    }

    /// Spawn one poller per ready subsystem. Already running pollers are kept.
    pub fn start_polling(&mut self) {
        for (role, sub) in &mut self.subsystems {
            if sub.poller.is_some() {
                continue;
            }
            let Some(driver) = sub.ready().map(|c| c.driver.clone()) else {
                continue;
            };
            info!(subsystem = %role, interval_ms = sub.poll.interval.as_millis() as u64, "polling started");
            sub.poller = Some(Poller::spawn(driver, sub.poll));
        }
    }

    /// Published (smoothed) snapshots of a subsystem's poller.
    pub fn subscribe(&self, role: Role) -> Option<watch::Receiver<Snapshot>> {
        self.subsystems
            .get(&role)?
            .poller
            .as_ref()
            .map(PollerHandle::subscribe)
    }

    /// Stop and join every poller.
    pub async fn stop_polling(&mut self) -> BTreeMap<Role, PollerStats> {
        let mut stats = BTreeMap::new();
        for (role, sub) in &mut self.subsystems {
            if let Some(poller) = sub.poller.take() {
                let result = poller.stop().await;
                info!(subsystem = %role, ticks = result.ticks, failures = result.failures, "polling stopped");
                stats.insert(*role, result);
            }
        }
        stats
    }

    /// Stop the pollers, then close every driver.
    pub async fn shutdown(&mut self) -> BTreeMap<Role, PollerStats> {
        let stats = self.stop_polling().await;
        for (role, sub) in &mut self.subsystems {
            if let Some(components) = sub.components.take() {
                components.driver.close().await;
                info!(subsystem = %role, "subsystem closed");
            }
            if sub.status.is_ready() {
                sub.status = SubsystemStatus::Disabled {
                    reason: "shut down".to_string(),
                };
            }
        }
        stats
    }
}
