//! Message bus: named transport connections behind one request/publish/
//! enqueue surface.
//!
//! Drivers and configs are registered before setup. Open connects one
//! connection per config, registers every Service of the core registry on
//! it, and publishes an immutable snapshot of the opened connections plus a
//! weighted selector. Outgoing traffic picks a connection from the snapshot;
//! Close swaps in an empty one.

pub mod config;
pub mod connection;
pub mod inproc;
#[cfg(feature = "nats")]
pub mod nats;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use corebus_core::envelope::{decode_response, encode_request};
use corebus_core::{subject, Map, RequestEnvelope, Res, SubjectKind, WeightedSelector};
use parking_lot::RwLock;

pub use config::{parse_section, BusConfig, BusInstance, DEFAULT_NAME};
pub use connection::{Connection, Driver, ServiceStats, StatsRecorder};
pub use inproc::{InprocConnection, InprocDriver};
#[cfg(feature = "nats")]
pub use nats::{NatsConnection, NatsDriver};

use crate::error::{BootstrapError, InvocationError};
use crate::meta::Meta;
use crate::module::{Module, Registration};
use crate::registry::{Host, Registry, Remote};

/// Key of the bus section in the runtime config map.
pub const CONFIG_KEY: &str = "bus";

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

struct Link {
    config: BusConfig,
    conn: Arc<dyn Connection>,
}

/// Opened connections and their selector. Replaced wholesale, never mutated.
#[derive(Default)]
struct Snapshot {
    links: BTreeMap<String, Link>,
    selector: WeightedSelector,
}

impl Snapshot {
    fn pick(&self) -> Option<&Link> {
        self.selector.next().and_then(|name| self.links.get(name))
    }
}

// ---------------------------------------------------------------------------
// BusModule
// ---------------------------------------------------------------------------

/// Owns bus drivers, configs and opened connections.
pub struct BusModule {
    registry: Arc<Registry>,
    drivers: RwLock<BTreeMap<String, Arc<dyn Driver>>>,
    configs: RwLock<BTreeMap<String, BusConfig>>,
    frozen: AtomicBool,
    snapshot: ArcSwap<Snapshot>,
}

impl BusModule {
    /// Creates a bus serving the Services of `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            drivers: RwLock::new(BTreeMap::new()),
            configs: RwLock::new(BTreeMap::new()),
            frozen: AtomicBool::new(false),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    /// Registers a transport driver. An empty name means `default`.
    ///
    /// # Errors
    ///
    /// Fails if a driver with that name exists.
    pub fn register_driver(&self, name: &str, driver: Arc<dyn Driver>) -> Result<(), BootstrapError> {
        let name = or_default(name);
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&name) {
            return Err(BootstrapError::Duplicate { kind: "bus driver", name });
        }
        drivers.insert(name, driver);
        Ok(())
    }

    /// Registers a named bus config. An empty name means `default`.
    ///
    /// # Errors
    ///
    /// Fails after setup or if a config with that name exists.
    pub fn register_config(&self, name: &str, config: BusConfig) -> Result<(), BootstrapError> {
        let name = or_default(name);
        let mut configs = self.configs.write();
        // Setup flips `frozen` under this lock.
        if self.frozen.load(Ordering::Acquire) {
            return Err(BootstrapError::Frozen(name));
        }
        if configs.contains_key(&name) {
            return Err(BootstrapError::Duplicate { kind: "bus config", name });
        }
        configs.insert(name, config);
        Ok(())
    }

    /// Registers several configs, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`BusModule::register_config`].
    pub fn register_configs(&self, configs: BTreeMap<String, BusConfig>) -> Result<(), BootstrapError> {
        for (name, config) in configs {
            self.register_config(&name, config)?;
        }
        Ok(())
    }

    /// Registered configs, normalised once setup has run.
    #[must_use]
    pub fn configs(&self) -> BTreeMap<String, BusConfig> {
        self.configs.read().clone()
    }

    /// Whether any connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.snapshot.load().links.is_empty()
    }

    /// Names of the opened connections.
    #[must_use]
    pub fn connection_names(&self) -> Vec<String> {
        self.snapshot.load().links.keys().cloned().collect()
    }

    /// Per-connection service stats, keyed by config name.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, Vec<ServiceStats>> {
        self.snapshot
            .load()
            .links
            .iter()
            .map(|(name, link)| (name.clone(), link.conn.stats()))
            .collect()
    }

    /// Sends a call to whichever connection the selector picks and waits
    /// for the reply. Every failure comes back as an error result.
    pub async fn request(&self, meta: &Meta, name: &str, payload: Map, timeout: Duration) -> (Map, Res) {
        match self.try_request(meta, name, payload, timeout).await {
            Ok(out) => out,
            Err(e) => (Map::new(), e.into()),
        }
    }

    async fn try_request(
        &self,
        meta: &Meta,
        name: &str,
        payload: Map,
        timeout: Duration,
    ) -> Result<(Map, Res), InvocationError> {
        let snapshot = self.snapshot.load_full();
        let link = snapshot.pick().ok_or(InvocationError::BusNotReady)?;
        let data = envelope(meta, name, payload)?;
        let target = subject(&link.config.prefix, SubjectKind::Call, name);
        let reply = link.conn.request(&target, data, timeout).await?;
        Ok(decode_response(&reply)?.into_parts())
    }

    /// Broadcasts `name` to every subscriber.
    ///
    /// # Errors
    ///
    /// Returns submission errors only; delivery is not confirmed.
    pub async fn publish(&self, meta: &Meta, name: &str, payload: Map) -> Result<(), InvocationError> {
        let snapshot = self.snapshot.load_full();
        let link = snapshot.pick().ok_or(InvocationError::BusNotReady)?;
        let data = envelope(meta, name, payload)?;
        let target = subject(&link.config.prefix, SubjectKind::Event, name);
        link.conn.publish(&target, data).await
    }

    /// Hands `name` to exactly one subscriber.
    ///
    /// # Errors
    ///
    /// Returns submission errors only; delivery is not confirmed.
    pub async fn enqueue(&self, meta: &Meta, name: &str, payload: Map) -> Result<(), InvocationError> {
        let snapshot = self.snapshot.load_full();
        let link = snapshot.pick().ok_or(InvocationError::BusNotReady)?;
        let data = envelope(meta, name, payload)?;
        let target = subject(&link.config.prefix, SubjectKind::Queue, name);
        link.conn.enqueue(&target, data).await
    }

    async fn open_all(&self) -> anyhow::Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let configs = self.configs();
        if configs.is_empty() {
            return Err(BootstrapError::MissingConfig.into());
        }
        let services = self.registry.service_names();
        let host: Arc<dyn Host> = self.registry.clone();

        let mut links: BTreeMap<String, Link> = BTreeMap::new();
        for (name, config) in configs {
            match self.open_one(&name, &config, &host, &services).await {
                Ok(conn) => {
                    links.insert(name, Link { config, conn });
                }
                Err(e) => {
                    close_links(&links).await;
                    return Err(e.into());
                }
            }
        }

        let weights: BTreeMap<String, i64> = links
            .iter()
            .map(|(name, link)| (name.clone(), link.config.weight))
            .collect();
        self.snapshot.store(Arc::new(Snapshot {
            links,
            selector: WeightedSelector::new(&weights),
        }));
        Ok(())
    }

    async fn open_one(
        &self,
        name: &str,
        config: &BusConfig,
        host: &Arc<dyn Host>,
        services: &[String],
    ) -> Result<Arc<dyn Connection>, BootstrapError> {
        let driver = self
            .drivers
            .read()
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| BootstrapError::MissingDriver(config.driver.clone()))?;

        let instance = BusInstance {
            name: name.to_string(),
            config: config.clone(),
            host: Arc::clone(host),
        };
        let conn = driver.connect(instance).await.map_err(|source| BootstrapError::Connect {
            config: name.to_string(),
            source,
        })?;
        conn.open().await.map_err(|source| BootstrapError::Open {
            config: name.to_string(),
            source,
        })?;

        for service in services {
            if let Err(source) = conn.register(service).await {
                if let Err(e) = conn.close().await {
                    tracing::warn!(bus = name, error = %e, "failed to close bus after register error");
                }
                return Err(BootstrapError::Register {
                    config: name.to_string(),
                    subject: service.clone(),
                    source,
                });
            }
        }

        tracing::info!(
            bus = name,
            driver = %config.driver,
            weight = config.weight,
            services = services.len(),
            "bus connection opened"
        );
        Ok(conn)
    }
}

fn or_default(name: &str) -> String {
    if name.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        name.to_string()
    }
}

fn envelope(meta: &Meta, name: &str, payload: Map) -> Result<Bytes, InvocationError> {
    let req = RequestEnvelope {
        metadata: meta.metadata(),
        name: name.to_string(),
        payload,
    };
    Ok(Bytes::from(encode_request(&req)?))
}

async fn close_links(links: &BTreeMap<String, Link>) {
    for (name, link) in links {
        match link.conn.close().await {
            Ok(()) => tracing::info!(bus = %name, "bus connection closed"),
            Err(e) => tracing::warn!(bus = %name, error = %e, "failed to close bus connection"),
        }
    }
}

impl fmt::Debug for BusModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusModule")
            .field("drivers", &self.drivers.read().keys().collect::<Vec<_>>())
            .field("configs", &self.configs.read().keys().collect::<Vec<_>>())
            .field("open", &self.connection_names())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Remote for BusModule {
    async fn request(&self, meta: &Meta, name: &str, payload: Map, timeout: Duration) -> (Map, Res) {
        BusModule::request(self, meta, name, payload, timeout).await
    }

    async fn publish(&self, meta: &Meta, name: &str, payload: Map) -> Result<(), InvocationError> {
        BusModule::publish(self, meta, name, payload).await
    }

    async fn enqueue(&self, meta: &Meta, name: &str, payload: Map) -> Result<(), InvocationError> {
        BusModule::enqueue(self, meta, name, payload).await
    }
}

#[async_trait]
impl Module for BusModule {
    fn name(&self) -> &'static str {
        "bus"
    }

    fn register(&self, name: &str, value: &Registration) -> anyhow::Result<()> {
        match value {
            Registration::Driver(driver) => self.register_driver(name, Arc::clone(driver))?,
            Registration::BusConfig(config) => self.register_config(name, config.clone())?,
            Registration::BusConfigs(configs) => self.register_configs(configs.clone())?,
            _ => {}
        }
        Ok(())
    }

    fn config(&self, cfg: &Map) -> anyhow::Result<()> {
        let Some(section) = cfg.get(CONFIG_KEY) else {
            return Ok(());
        };
        let configs = parse_section(section).context("invalid bus config section")?;
        self.register_configs(configs)?;
        Ok(())
    }

    async fn setup(&self) -> anyhow::Result<()> {
        let mut configs = self.configs.write();
        self.frozen.store(true, Ordering::Release);
        if configs.is_empty() {
            configs.insert(DEFAULT_NAME.to_string(), BusConfig::default());
        }
        for config in configs.values_mut() {
            config.normalize();
        }
        Ok(())
    }

    async fn open(&self) -> anyhow::Result<()> {
        self.open_all().await
    }

    async fn start(&self) -> anyhow::Result<()> {
        let snapshot = self.snapshot.load_full();
        if snapshot.links.is_empty() {
            return Err(BootstrapError::NotOpened.into());
        }
        for (name, link) in &snapshot.links {
            link.conn
                .start()
                .await
                .with_context(|| format!("failed to start bus {name}"))?;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let snapshot = self.snapshot.load_full();
        for (name, link) in &snapshot.links {
            if let Err(e) = link.conn.stop().await {
                tracing::warn!(bus = %name, error = %e, "failed to stop bus connection");
            }
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let snapshot = self.snapshot.swap(Arc::new(Snapshot::default()));
        close_links(&snapshot.links).await;
        self.frozen.store(false, Ordering::Release);
        Ok(())
    }
}
