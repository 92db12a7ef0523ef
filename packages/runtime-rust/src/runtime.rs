//! Lifecycle coordinator.
//!
//! A [`Runtime`] owns an ordered list of mounted modules and drives them
//! through setup, open, start, stop and close. The built-in modules are
//! mounted at construction in the order core, provider, trigger, bus.
//!
//! `start` triggers fire detached once every module has started, so they
//! can already reach the bus. `stop` triggers run and are awaited once every
//! module has stopped.

use std::sync::Arc;

use corebus_core::{Map, Res};
use parking_lot::{Mutex, RwLock};

use crate::bus::{BusModule, InprocDriver};
use crate::config::{ConfigSource, RuntimeConfig, RuntimeOptions};
use crate::detached::DetachedPool;
use crate::meta::Meta;
use crate::error::ProviderError;
use crate::module::{Module, Registration};
use crate::provider::ProviderModule;
use crate::registry::{Registry, Remote};
use crate::signals;
use crate::trigger::{TriggerModule, START_EVENT, STOP_EVENT};

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    configured: bool,
    setup: bool,
    opened: bool,
    started: bool,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Setup,
    Open,
    Start,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Open => "open",
            Phase::Start => "start",
        }
    }

    fn done(self, flags: &Flags) -> bool {
        match self {
            Phase::Setup => flags.setup,
            Phase::Open => flags.opened,
            Phase::Start => flags.started,
        }
    }

    fn mark(self, flags: &mut Flags) {
        match self {
            Phase::Setup => {
                flags.setup = true;
                flags.closed = false;
            }
            Phase::Open => flags.opened = true,
            Phase::Start => flags.started = true,
        }
    }
}

/// One runtime instance. Several may coexist in a process.
pub struct Runtime {
    modules: RwLock<Vec<Arc<dyn Module>>>,
    flags: Mutex<Flags>,
    /// Serialises lifecycle phases.
    phase: tokio::sync::Mutex<()>,
    config: RwLock<RuntimeConfig>,
    registry: Arc<Registry>,
    providers: Arc<ProviderModule>,
    triggers: Arc<TriggerModule>,
    bus: Arc<BusModule>,
}

impl Runtime {
    /// Creates a runtime with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(&RuntimeOptions::default())
    }

    /// Creates a runtime with the built-in modules mounted and the built-in
    /// bus drivers registered.
    #[must_use]
    pub fn with_options(options: &RuntimeOptions) -> Self {
        let detached = DetachedPool::new(options.max_detached_tasks);
        let registry = Arc::new(Registry::new(options.default_call_timeout, detached));
        let providers = Arc::new(ProviderModule::new());
        let triggers = Arc::new(TriggerModule::new(Arc::clone(&registry)));
        let bus = Arc::new(BusModule::new(Arc::clone(&registry)));

        let remote: Arc<dyn Remote> = bus.clone();
        registry.attach_remote(Arc::downgrade(&remote));

        let runtime = Self {
            modules: RwLock::new(Vec::new()),
            flags: Mutex::new(Flags::default()),
            phase: tokio::sync::Mutex::new(()),
            config: RwLock::new(RuntimeConfig::default()),
            registry,
            providers,
            triggers,
            bus,
        };
        runtime.mount(runtime.registry.clone());
        runtime.mount(runtime.providers.clone());
        runtime.mount(runtime.triggers.clone());
        runtime.mount(runtime.bus.clone());
        runtime.register_builtin_drivers();
        runtime
    }

    fn register_builtin_drivers(&self) {
        // The bus is fresh, so these names are free.
        if let Err(e) = self.bus.register_driver("default", Arc::new(InprocDriver)) {
            tracing::warn!(error = %e, "failed to register in-process bus driver");
        }
        #[cfg(feature = "nats")]
        if let Err(e) = self.bus.register_driver("nats", Arc::new(crate::bus::NatsDriver)) {
            tracing::warn!(error = %e, "failed to register nats bus driver");
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Appends a module unless the same instance is already mounted.
    pub fn mount(&self, module: Arc<dyn Module>) {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| Arc::ptr_eq(m, &module)) {
            return;
        }
        tracing::debug!(module = module.name(), "module mounted");
        modules.push(module);
    }

    /// Number of mounted modules.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.read().len()
    }

    fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.modules.read().clone()
    }

    /// Registers a value under `name`.
    ///
    /// Modules are mounted; config maps are merged into [`RuntimeConfig`]
    /// and handed to every module; everything else is offered to every
    /// module in mount order.
    ///
    /// # Errors
    ///
    /// Returns the first module error, typically a
    /// [`BootstrapError`](crate::BootstrapError).
    pub fn register(&self, name: &str, value: impl Into<Registration>) -> anyhow::Result<()> {
        match value.into() {
            Registration::Module(module) => {
                self.mount(module);
                Ok(())
            }
            Registration::Config(cfg) => self.apply_config(&cfg),
            other => {
                for module in self.modules() {
                    module.register(name, &other)?;
                }
                Ok(())
            }
        }
    }

    fn apply_config(&self, cfg: &Map) -> anyhow::Result<()> {
        {
            let mut flags = self.flags.lock();
            if flags.setup || flags.opened || flags.started {
                tracing::warn!("config registered after setup is ignored");
                return Ok(());
            }
            flags.configured = true;
        }
        self.config.write().merge(cfg);
        for module in self.modules() {
            module.config(cfg)?;
        }
        Ok(())
    }

    /// Loads a config map from `source` and registers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails or a module rejects the config.
    pub fn load_config(&self, source: &dyn ConfigSource) -> anyhow::Result<()> {
        let cfg = source.load_config()?;
        self.apply_config(&cfg)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    async fn advance(&self, phase: Phase) -> anyhow::Result<()> {
        let _guard = self.phase.lock().await;
        if phase.done(&self.flags.lock()) {
            return Ok(());
        }

        for module in self.modules() {
            let outcome = match phase {
                Phase::Setup => module.setup().await,
                Phase::Open => module.open().await,
                Phase::Start => module.start().await,
            };
            if let Err(e) = outcome {
                tracing::warn!(phase = phase.label(), module = module.name(), error = %e, "lifecycle phase failed");
                return Err(e);
            }
        }

        phase.mark(&mut self.flags.lock());
        tracing::info!(phase = phase.label(), name = %self.config.read().name, "runtime phase complete");
        if let Phase::Start = phase {
            self.triggers.toggle(START_EVENT, &Map::new());
        }
        Ok(())
    }

    /// Runs every module's setup once.
    ///
    /// # Errors
    ///
    /// Returns the first module error; the runtime stays not-set-up.
    pub async fn setup(&self) -> anyhow::Result<()> {
        self.advance(Phase::Setup).await
    }

    /// Runs every module's open once.
    ///
    /// # Errors
    ///
    /// Returns the first module error.
    pub async fn open(&self) -> anyhow::Result<()> {
        self.advance(Phase::Open).await
    }

    /// Runs every module's start once, then fires the `start` triggers on
    /// the detached pool.
    ///
    /// # Errors
    ///
    /// Returns the first module error.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.advance(Phase::Start).await
    }

    /// Stops every module in reverse mount order, then runs the `stop`
    /// triggers and waits for them. No-op unless started.
    ///
    /// Module errors are logged and the remaining modules still stop.
    pub async fn stop(&self) {
        let _guard = self.phase.lock().await;
        if !self.flags.lock().started {
            return;
        }
        for module in self.modules().iter().rev() {
            if let Err(e) = module.stop().await {
                tracing::warn!(module = module.name(), error = %e, "module stop failed");
            }
        }
        self.triggers.sync_toggle(STOP_EVENT, &Map::new()).await;
        self.flags.lock().started = false;
        tracing::info!(phase = "stop", "runtime phase complete");
    }

    /// Closes every module in reverse mount order. No-op unless set up or
    /// opened and not already closed. Leaves the runtime ready for another
    /// setup.
    pub async fn close(&self) {
        let _guard = self.phase.lock().await;
        {
            let flags = self.flags.lock();
            if flags.closed || !(flags.setup || flags.opened) {
                return;
            }
        }
        for module in self.modules().iter().rev() {
            if let Err(e) = module.close().await {
                tracing::warn!(module = module.name(), error = %e, "module close failed");
            }
        }
        {
            let mut flags = self.flags.lock();
            flags.opened = false;
            flags.setup = false;
            flags.closed = true;
        }
        tracing::info!(phase = "close", "runtime phase complete");
    }

    /// Setup, then open.
    ///
    /// # Errors
    ///
    /// Returns the first failing phase's error.
    pub async fn ready(&self) -> anyhow::Result<()> {
        self.setup().await?;
        self.open().await
    }

    /// Waits for a termination signal.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn wait(&self) -> anyhow::Result<()> {
        signals::wait_for_shutdown_signal().await?;
        Ok(())
    }

    /// Runs the whole lifecycle: setup, open, start, wait for a signal,
    /// stop, close.
    ///
    /// # Errors
    ///
    /// Returns a bootstrap error; anything opened so far is closed first.
    pub async fn go(&self) -> anyhow::Result<()> {
        if let Err(e) = self.bootstrap().await {
            self.close().await;
            return Err(e);
        }
        let waited = self.wait().await;
        self.stop().await;
        self.close().await;
        waited
    }

    async fn bootstrap(&self) -> anyhow::Result<()> {
        self.ready().await?;
        self.start().await
    }

    /// Waits for every detached task submitted so far.
    pub async fn drain(&self) {
        self.registry.detached().drain().await;
    }

    // -----------------------------------------------------------------------
    // Invocation and accessors
    // -----------------------------------------------------------------------

    /// Invokes `name` with fresh traced metadata.
    pub async fn invoke(&self, name: &str, payload: Map) -> (Map, Res) {
        self.invoke_with(Arc::new(Meta::traced()), name, payload).await
    }

    /// Invokes `name` with caller-provided metadata.
    pub async fn invoke_with(&self, meta: Arc<Meta>, name: &str, payload: Map) -> (Map, Res) {
        self.registry.invoke(meta, name, payload).await
    }

    /// Builds the resource registered under `name` and downcasts it to `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] for an unknown name, a failed build or a
    /// value of another type.
    pub fn use_provider<T>(&self, name: &str, setting: &Map) -> Result<Arc<T>, ProviderError>
    where
        T: std::any::Any + Send + Sync,
    {
        self.providers.use_provider(name, setting)
    }

    /// Fires a trigger event on the detached pool.
    pub fn toggle(&self, event: &str, payload: &Map) {
        self.triggers.toggle(event, payload);
    }

    /// Fires a trigger event and waits for every trigger to finish.
    pub async fn sync_toggle(&self, event: &str, payload: &Map) {
        self.triggers.sync_toggle(event, payload).await;
    }

    /// Snapshot of the merged runtime config.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<BusModule> {
        &self.bus
    }

    #[must_use]
    pub fn providers(&self) -> &Arc<ProviderModule> {
        &self.providers
    }

    #[must_use]
    pub fn triggers(&self) -> &Arc<TriggerModule> {
        &self.triggers
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.flags.lock().configured
    }

    #[must_use]
    pub fn is_setup(&self) -> bool {
        self.flags.lock().setup
    }

    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.flags.lock().opened
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.flags.lock().started
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("modules", &self.module_count())
            .field("flags", &*self.flags.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::bus::BusConfig;
    use crate::config::MapSource;
    use crate::error::BootstrapError;
    use crate::registry::{Context, Definition};
    use crate::trigger::Trigger;

    fn map(value: serde_json::Value) -> Map {
        value.as_object().cloned().unwrap()
    }

    /// Records every lifecycle call into a shared log.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_open: bool,
    }

    impl Recorder {
        fn new(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                log: Arc::clone(log),
                fail_open: false,
            })
        }

        fn push(&self, event: &str) {
            self.log.lock().push(format!("{}:{event}", self.label));
        }
    }

    #[async_trait]
    impl Module for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        fn register(&self, name: &str, value: &Registration) -> anyhow::Result<()> {
            if let Registration::Other(_) = value {
                self.push(&format!("register {name}"));
            }
            Ok(())
        }

        fn config(&self, _cfg: &Map) -> anyhow::Result<()> {
            self.push("config");
            Ok(())
        }

        async fn setup(&self) -> anyhow::Result<()> {
            self.push("setup");
            Ok(())
        }

        async fn open(&self) -> anyhow::Result<()> {
            if self.fail_open {
                anyhow::bail!("{} cannot open", self.label);
            }
            self.push("open");
            Ok(())
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.push("start");
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.push("stop");
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.push("close");
            Ok(())
        }
    }

    fn echo() -> Definition {
        Definition::new(|ctx: Context| async move { (ctx.payload, Res::ok()) })
    }

    #[test]
    fn builtin_modules_are_mounted() {
        let runtime = Runtime::new();
        assert_eq!(runtime.module_count(), 4);
    }

    #[test]
    fn mount_dedups_by_identity() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::new("p", &log);
        runtime.mount(recorder.clone());
        runtime.mount(recorder.clone());
        runtime.register("p", Registration::Module(recorder)).unwrap();
        runtime.register("q", Registration::Module(Recorder::new("p", &log))).unwrap();
        assert_eq!(runtime.module_count(), 6);
    }

    #[tokio::test]
    async fn phases_run_once_and_in_order() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Recorder::new("a", &log));
        runtime.mount(Recorder::new("b", &log));

        runtime.setup().await.unwrap();
        runtime.setup().await.unwrap();
        runtime.open().await.unwrap();
        runtime.start().await.unwrap();
        runtime.start().await.unwrap();
        runtime.stop().await;
        runtime.stop().await;
        runtime.close().await;
        runtime.close().await;

        assert_eq!(
            *log.lock(),
            vec![
                "a:setup", "b:setup", "a:open", "b:open", "a:start", "b:start", "b:stop",
                "a:stop", "b:close", "a:close",
            ]
        );
        assert!(!runtime.is_setup());
        assert!(!runtime.is_opened());
    }

    #[tokio::test]
    async fn stop_and_close_before_bootstrap_are_noops() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Recorder::new("a", &log));

        runtime.stop().await;
        runtime.close().await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_phase_leaves_flag_unset() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Arc::new(Recorder {
            label: "broken",
            log: Arc::clone(&log),
            fail_open: true,
        }));

        let err = runtime.ready().await.unwrap_err();
        assert!(err.to_string().contains("broken cannot open"));
        assert!(runtime.is_setup());
        assert!(!runtime.is_opened());
    }

    #[tokio::test]
    async fn runtime_can_be_bootstrapped_again_after_close() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Recorder::new("a", &log));
        runtime.register("start", Trigger::new(|_ctx: Context| async {})).unwrap();

        runtime.ready().await.unwrap();
        runtime.close().await;
        runtime.ready().await.unwrap();
        assert_eq!(log.lock().iter().filter(|e| *e == "a:setup").count(), 2);
        assert!(runtime.bus().is_open());
    }

    #[test]
    fn registrations_reach_every_module() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Recorder::new("a", &log));
        runtime.register("i18n", Registration::Other(Arc::new("en"))).unwrap();
        runtime.register("svc", Registration::Service(echo())).unwrap();

        assert_eq!(*log.lock(), vec!["a:register i18n"]);
        assert!(runtime.registry().contains("svc"));
    }

    #[test]
    fn duplicate_registration_is_returned() {
        let runtime = Runtime::new();
        runtime.register("svc", Registration::Method(echo())).unwrap();
        let err = runtime.register("svc", Registration::Service(echo())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn config_merges_until_setup() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Recorder::new("a", &log));

        runtime
            .register("", map(json!({"name": "orders", "setting": {"tier": "gold"}})))
            .unwrap();
        assert!(runtime.is_configured());
        assert_eq!(runtime.config().name, "orders");

        runtime.setup().await.unwrap();
        runtime.register("", map(json!({"name": "late"}))).unwrap();
        assert_eq!(runtime.config().name, "orders");
        assert_eq!(log.lock().iter().filter(|e| *e == "a:config").count(), 1);
    }

    #[tokio::test]
    async fn load_config_registers_bus_section() {
        let runtime = Runtime::new();
        runtime
            .load_config(&MapSource(map(json!({
                "node": "n7",
                "bus": {"primary": {"weight": 2}, "secondary": {}}
            }))))
            .unwrap();
        assert_eq!(runtime.config().node, "n7");

        runtime.ready().await.unwrap();
        assert_eq!(runtime.bus().connection_names(), vec!["primary", "secondary"]);
        runtime.close().await;
    }

    #[tokio::test]
    async fn invoke_without_bus_is_not_ready() {
        let runtime = Runtime::new();
        let (_, res) = runtime.invoke("y", Map::new()).await;
        assert_eq!(res.state, "bus.not_ready");
    }

    #[tokio::test]
    async fn unknown_names_fall_through_to_bus() {
        let runtime = Runtime::new();
        runtime
            .register("", BusConfig::default().with_prefix("edge."))
            .unwrap();
        runtime.register("svc", Registration::Service(echo())).unwrap();
        runtime.ready().await.unwrap();
        runtime.start().await.unwrap();

        let (data, res) = runtime.invoke("svc", map(json!({"x": 1}))).await;
        assert!(res.is_ok());
        assert_eq!(data["x"], json!(1));

        // Not registered anywhere: the bus answers with not-found.
        let (_, res) = runtime.invoke("ghost", Map::new()).await;
        assert_eq!(res.state, "invoke.not_found");

        runtime.stop().await;
        runtime.close().await;
    }

    #[tokio::test]
    async fn stop_waits_for_stop_triggers() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        runtime
            .register(
                "stop",
                Trigger::new(move |_ctx: Context| {
                    let l = Arc::clone(&l);
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        l.lock().push("done".to_string());
                    }
                }),
            )
            .unwrap();

        runtime.ready().await.unwrap();
        runtime.start().await.unwrap();
        runtime.stop().await;
        assert_eq!(*log.lock(), vec!["done"]);
        runtime.close().await;
    }

    #[tokio::test]
    async fn start_triggers_run_detached_and_drain() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        runtime
            .register(
                "start",
                Trigger::new(move |_ctx: Context| {
                    let l = Arc::clone(&l);
                    async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        l.lock().push("started".to_string());
                    }
                }),
            )
            .unwrap();

        runtime.ready().await.unwrap();
        runtime.start().await.unwrap();
        runtime.drain().await;
        assert_eq!(*log.lock(), vec!["started"]);
        runtime.stop().await;
        runtime.close().await;
    }

    #[tokio::test]
    async fn instances_are_isolated() {
        let a = Runtime::new();
        let b = Runtime::new();
        a.register("only.a", Registration::Method(echo())).unwrap();
        b.register("only.a", Registration::Method(echo())).unwrap();

        let (_, res) = a.invoke("only.a", Map::new()).await;
        assert!(res.is_ok());
        assert!(!Arc::ptr_eq(a.registry(), b.registry()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_triggers_see_a_started_bus() {
        for _ in 0..50 {
            let runtime = Runtime::new();
            let served = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let failures = Arc::new(Mutex::new(Vec::new()));

            let s = Arc::clone(&served);
            runtime
                .register(
                    "svc",
                    Registration::Service(Definition::new(move |_ctx: Context| {
                        let s = Arc::clone(&s);
                        async move {
                            s.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            (Map::new(), Res::ok())
                        }
                    })),
                )
                .unwrap();
            let f = Arc::clone(&failures);
            runtime
                .register(
                    "start",
                    Trigger::new(move |ctx: Context| {
                        let f = Arc::clone(&f);
                        async move {
                            if let Err(e) = ctx.publish("svc", Map::new()).await {
                                f.lock().push(e.to_string());
                            }
                        }
                    }),
                )
                .unwrap();

            runtime.ready().await.unwrap();
            runtime.start().await.unwrap();
            runtime.drain().await;

            assert!(failures.lock().is_empty(), "{:?}", failures.lock());
            assert_eq!(served.load(std::sync::atomic::Ordering::SeqCst), 1);
            runtime.stop().await;
            runtime.close().await;
        }
    }

    #[tokio::test]
    async fn stop_triggers_run_after_modules_stop() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        runtime.mount(Recorder::new("a", &log));
        let l = Arc::clone(&log);
        runtime
            .register(
                "stop",
                Trigger::new(move |_ctx: Context| {
                    let l = Arc::clone(&l);
                    async move {
                        l.lock().push("trigger:stop".to_string());
                    }
                }),
            )
            .unwrap();

        runtime.ready().await.unwrap();
        runtime.start().await.unwrap();
        runtime.stop().await;
        let log = log.lock().clone();
        assert_eq!(&log[log.len() - 2..], ["a:stop", "trigger:stop"]);
        runtime.close().await;
    }

    #[tokio::test]
    async fn start_without_open_fails_on_bus() {
        let runtime = Runtime::new();
        runtime.setup().await.unwrap();
        let err = runtime.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::NotOpened)
        ));
        assert!(!runtime.is_started());
    }

    #[tokio::test]
    async fn negative_weight_config_takes_no_traffic() {
        let runtime = Runtime::new();
        runtime
            .load_config(&MapSource(map(json!({
                "bus": {"neg": {"weight": -1}, "pos": {"weight": 1}}
            }))))
            .unwrap();
        runtime.register("svc", Registration::Service(echo())).unwrap();
        runtime.ready().await.unwrap();
        runtime.start().await.unwrap();

        for _ in 0..4 {
            let (_, res) = runtime
                .bus()
                .request(&Meta::new(), "svc", Map::new(), Duration::from_secs(1))
                .await;
            assert!(res.is_ok());
        }
        let stats = runtime.bus().stats();
        let total = |name: &str| -> u64 { stats[name].iter().map(|s| s.num_requests).sum() };
        assert_eq!(total("neg"), 0);
        assert_eq!(total("pos"), 4);

        runtime.stop().await;
        runtime.close().await;
    }

    #[test]
    fn providers_are_registered_and_typed() {
        let runtime = Runtime::new();
        let provider: Arc<dyn crate::provider::Provider> =
            Arc::new(|setting: &Map| -> anyhow::Result<crate::provider::Provided> {
                let dsn = setting.get("dsn").and_then(|v| v.as_str()).unwrap_or("mem://");
                Ok(Arc::new(dsn.to_string()))
            });
        runtime.register("db", Registration::Provider(Arc::clone(&provider))).unwrap();

        let dsn: Arc<String> = runtime
            .use_provider("db", &map(json!({"dsn": "pg://orders"})))
            .unwrap();
        assert_eq!(dsn.as_str(), "pg://orders");
        assert!(matches!(
            runtime.use_provider::<u32>("db", &Map::new()),
            Err(ProviderError::TypeMismatch { .. })
        ));
        assert!(matches!(
            runtime.use_provider::<String>("cache", &Map::new()),
            Err(ProviderError::NotRegistered(_))
        ));

        let err = runtime.register("db", Registration::Provider(provider)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BootstrapError>(),
            Some(BootstrapError::Duplicate { kind: "provider", .. })
        ));
    }
}
