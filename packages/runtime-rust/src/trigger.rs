//! Lifecycle-event triggers.
//!
//! Triggers are handlers keyed by an event name (`start`, `stop`, or any
//! application event). At setup each one is materialised as a synthetic
//! Method `_.{event}.{seq}` in the core registry, so firing an event goes
//! through the normal local invocation path.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use corebus_core::{Map, Res};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::BootstrapError;
use crate::meta::Meta;
use crate::module::{Module, Registration};
use crate::registry::{Context, Definition, Registry};

/// Event fired detached once every module has started.
pub const START_EVENT: &str = "start";
/// Event fired and awaited once every module has stopped.
pub const STOP_EVENT: &str = "stop";

/// Boxed trigger body.
pub type TriggerAction = Arc<dyn Fn(Context) -> BoxFuture<'static, ()> + Send + Sync>;

/// A handler run when its event fires. The event payload arrives as
/// `ctx.payload`.
#[derive(Clone)]
pub struct Trigger {
    pub desc: String,
    pub action: TriggerAction,
}

impl Trigger {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            desc: String::new(),
            action: Arc::new(move |ctx: Context| -> BoxFuture<'static, ()> {
                Box::pin(action(ctx))
            }),
        }
    }

    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

/// Event name -> triggers, fired through synthetic registry methods.
pub struct TriggerModule {
    registry: Arc<Registry>,
    triggers: RwLock<BTreeMap<String, Vec<Trigger>>>,
    /// Synthetic method names per event, in registration order.
    methods: RwLock<BTreeMap<String, Vec<String>>>,
    seq: AtomicU64,
    materialised: AtomicBool,
}

impl TriggerModule {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            triggers: RwLock::new(BTreeMap::new()),
            methods: RwLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            materialised: AtomicBool::new(false),
        }
    }

    /// Appends a trigger for `event`.
    ///
    /// # Errors
    ///
    /// Fails if the event name is empty.
    pub fn register_trigger(&self, event: &str, trigger: Trigger) -> Result<(), BootstrapError> {
        if event.is_empty() {
            return Err(BootstrapError::InvalidName { kind: "trigger" });
        }
        if self.materialised.load(Ordering::Acquire) {
            tracing::warn!(event, "trigger registered after setup will not fire");
        }
        self.triggers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(trigger);
        Ok(())
    }

    /// Number of triggers registered for `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.triggers.read().get(event).map_or(0, Vec::len)
    }

    fn method_names(&self, event: &str) -> Vec<String> {
        self.methods.read().get(event).cloned().unwrap_or_default()
    }

    /// Fires `event` on the detached pool and returns immediately.
    pub fn toggle(&self, event: &str, payload: &Map) {
        for name in self.method_names(event) {
            let registry = Arc::clone(&self.registry);
            let payload = payload.clone();
            self.registry.detached().spawn(async move {
                fire(&registry, &name, payload).await;
            });
        }
    }

    /// Fires `event` on the calling task, one trigger after another, and
    /// returns once all have completed.
    pub async fn sync_toggle(&self, event: &str, payload: &Map) {
        for name in self.method_names(event) {
            fire(&self.registry, &name, payload.clone()).await;
        }
    }

    fn materialise(&self) -> Result<(), BootstrapError> {
        let triggers = self.triggers.read().clone();
        let mut methods = self.methods.write();
        for (event, list) in triggers {
            for trigger in list {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
                let name = format!("_.{event}.{seq}");
                let action = Arc::clone(&trigger.action);
                let def = Definition::new(move |ctx: Context| {
                    let action = Arc::clone(&action);
                    async move {
                        action(ctx).await;
                        (Map::new(), Res::ok())
                    }
                })
                .with_desc(trigger.desc.clone());
                self.registry.register_method(&name, def)?;
                methods.entry(event.clone()).or_default().push(name);
            }
        }
        Ok(())
    }
}

async fn fire(registry: &Arc<Registry>, name: &str, payload: Map) {
    let meta = Arc::new(Meta::traced());
    match registry.invoke_local(meta, name, payload, &[]).await {
        Some((_, res)) if res.is_fail() => {
            tracing::warn!(trigger = name, state = %res.state, "trigger failed");
        }
        Some(_) => {}
        None => tracing::warn!(trigger = name, "trigger method missing"),
    }
}

impl fmt::Debug for TriggerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerModule")
            .field("events", &self.triggers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Module for TriggerModule {
    fn name(&self) -> &'static str {
        "trigger"
    }

    fn register(&self, name: &str, value: &Registration) -> anyhow::Result<()> {
        if let Registration::Trigger(trigger) = value {
            self.register_trigger(name, trigger.clone())?;
        }
        Ok(())
    }

    async fn setup(&self) -> anyhow::Result<()> {
        // Registry entries are insert-once, so a re-bootstrap keeps the
        // methods created by the first setup.
        if self.materialised.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.materialise()?;
        Ok(())
    }
}
