//! Driver registry: configured family name to constructed driver.

use mfc_core::driver::{DeviceComponents, DriverFactory, DriverFamily};
use mfc_core::error::{RigError, RigResult};
use mfc_core::poller::PollerConfig;
use std::collections::HashMap;

use crate::mock;

/// A built device and the cadence it should be polled at.
#[derive(Debug, Clone)]
pub struct BuiltDevice {
    pub components: DeviceComponents,
    pub poll: PollerConfig,
}

/// Maps each [`DriverFamily`] to the factory that builds it.
pub struct DriverRegistry {
    factories: HashMap<DriverFamily, Box<dyn DriverFactory>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DriverRegistry {
    /// Registry without any factories.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Every hardware family this build supports, plus the simulated ones.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_factory(Box::new(mfc_driver_wago::WagoFactory));
        registry.register_factory(Box::new(mfc_driver_asi::AsiFactory));
        registry.register_factory(Box::new(mfc_driver_galil::GalilFactory));
        #[cfg(feature = "mfcs_sdk")]
        registry.register_factory(Box::new(mfc_driver_fluigent::MfcsEzFactory::native()));
        mock::register_all(&mut registry);
        registry
    }

    /// Register a factory, replacing any previous one for the same family.
    pub fn register_factory(
        &mut self,
        factory: Box<dyn DriverFactory>,
    ) -> Option<Box<dyn DriverFactory>> {
        tracing::debug!(
            family = %factory.family(),
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories.insert(factory.family(), factory)
    }

    pub fn has_factory(&self, family: DriverFamily) -> bool {
        self.factories.contains_key(&family)
    }

    /// Registered families, sorted by name.
    pub fn families(&self) -> Vec<DriverFamily> {
        let mut families: Vec<_> = self.factories.keys().copied().collect();
        families.sort_by_key(|f| f.as_str());
        families
    }

    pub fn factory(&self, family: DriverFamily) -> RigResult<&dyn DriverFactory> {
        self.factories
            .get(&family)
            .map(|f| f.as_ref())
            .ok_or_else(|| {
                RigError::UnknownDriver(format!("{family} (not available in this build)"))
            })
    }

    /// Resolve `hardware` and validate `args` without constructing anything.
    pub fn validate(&self, hardware: &str, args: &[toml::Value]) -> RigResult<DriverFamily> {
        let family: DriverFamily = hardware.parse()?;
        self.factory(family)?.validate(args)?;
        Ok(family)
    }

    /// Resolve `hardware`, validate `args` and build the driver. The driver
    /// is not connected.
    pub async fn build(&self, hardware: &str, args: Vec<toml::Value>) -> RigResult<BuiltDevice> {
        let family = self.validate(hardware, &args)?;
        let factory = self.factory(family)?;
        let components = factory.build(args).await?;
        Ok(BuiltDevice {
            components,
            poll: factory.default_poll(),
        })
    }
}
