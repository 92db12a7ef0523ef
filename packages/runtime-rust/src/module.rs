//! The module contract and the closed set of registrable values.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use corebus_core::Map;

use crate::bus::{BusConfig, Driver};
use crate::provider::Provider;
use crate::registry::{Definition, Library};
use crate::trigger::Trigger;

// ---------------------------------------------------------------------------
// Module trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed capability unit mounted into a [`Runtime`](crate::Runtime).
///
/// Modules are set up, opened and started in mount order, and stopped and
/// closed in reverse mount order. Every registration is broadcast to every
/// module; each one matches the [`Registration`] variants it handles and
/// ignores the rest. Any error returned here is a bootstrap fault.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Accepts a registration broadcast by the runtime.
    fn register(&self, _name: &str, _value: &Registration) -> anyhow::Result<()> {
        Ok(())
    }

    /// Receives the runtime configuration map before setup.
    fn config(&self, _cfg: &Map) -> anyhow::Result<()> {
        Ok(())
    }

    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Everything that can be passed to [`Runtime::register`](crate::Runtime::register).
#[derive(Clone)]
pub enum Registration {
    /// Mounts another module.
    Module(Arc<dyn Module>),
    /// Merged into the runtime config and forwarded to every module.
    Config(Map),
    /// A bus transport driver.
    Driver(Arc<dyn Driver>),
    /// A named bus configuration.
    BusConfig(BusConfig),
    /// Several named bus configurations at once.
    BusConfigs(BTreeMap<String, BusConfig>),
    /// A local-only handler.
    Method(Definition),
    /// A handler reachable locally first, then over the bus.
    Service(Definition),
    /// A group of methods sharing default settings.
    Library(Library),
    /// A lifecycle-event handler; the name is the event.
    Trigger(Trigger),
    /// A named resource factory.
    Provider(Arc<dyn Provider>),
    /// Opaque value for registries outside the core (i18n, codecs, ...).
    Other(Arc<dyn Any + Send + Sync>),
}

impl Registration {
    /// Variant name, for logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Registration::Module(_) => "module",
            Registration::Config(_) => "config",
            Registration::Driver(_) => "driver",
            Registration::BusConfig(_) => "bus config",
            Registration::BusConfigs(_) => "bus configs",
            Registration::Method(_) => "method",
            Registration::Service(_) => "service",
            Registration::Library(_) => "library",
            Registration::Trigger(_) => "trigger",
            Registration::Provider(_) => "provider",
            Registration::Other(_) => "other",
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Registration::Module(m) => write!(f, "Registration::Module({})", m.name()),
            Registration::Config(cfg) => f.debug_tuple("Registration::Config").field(cfg).finish(),
            Registration::BusConfig(cfg) => {
                f.debug_tuple("Registration::BusConfig").field(cfg).finish()
            }
            Registration::BusConfigs(cfgs) => {
                f.debug_tuple("Registration::BusConfigs").field(cfgs).finish()
            }
            other => write!(f, "Registration::{}", other.kind()),
        }
    }
}

impl From<Map> for Registration {
    fn from(cfg: Map) -> Self {
        Registration::Config(cfg)
    }
}

impl From<BusConfig> for Registration {
    fn from(cfg: BusConfig) -> Self {
        Registration::BusConfig(cfg)
    }
}

impl From<BTreeMap<String, BusConfig>> for Registration {
    fn from(cfgs: BTreeMap<String, BusConfig>) -> Self {
        Registration::BusConfigs(cfgs)
    }
}

impl From<Library> for Registration {
    fn from(lib: Library) -> Self {
        Registration::Library(lib)
    }
}

impl From<Arc<dyn Provider>> for Registration {
    fn from(provider: Arc<dyn Provider>) -> Self {
        Registration::Provider(provider)
    }
}

impl From<Trigger> for Registration {
    fn from(trigger: Trigger) -> Self {
        Registration::Trigger(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Module for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[test]
    fn kinds_and_debug() {
        let module = Registration::Module(Arc::new(Noop));
        assert_eq!(module.kind(), "module");
        assert_eq!(format!("{module:?}"), "Registration::Module(noop)");

        let other = Registration::Other(Arc::new(42u8));
        assert_eq!(format!("{other:?}"), "Registration::other");
    }

    #[test]
    fn from_conversions() {
        assert_eq!(Registration::from(Map::new()).kind(), "config");
        assert_eq!(Registration::from(BusConfig::default()).kind(), "bus config");
        assert_eq!(Registration::from(BTreeMap::new()).kind(), "bus configs");
    }

    #[tokio::test]
    async fn default_lifecycle_is_noop() {
        let module = Noop;
        module.register("x", &Registration::Config(Map::new())).unwrap();
        module.config(&Map::new()).unwrap();
        module.setup().await.unwrap();
        module.open().await.unwrap();
        module.start().await.unwrap();
        module.stop().await.unwrap();
        module.close().await.unwrap();
    }
}
