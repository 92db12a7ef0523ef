//! Core invocation registry: name -> handler table with local-first dispatch.
//!
//! Two entry kinds share one namespace:
//! - **Method**: local only. Never exposed to the bus.
//! - **Service**: served locally when registered here; exposed on the bus
//!   so remote nodes can reach it.
//!
//! [`Registry::invoke`] resolves a name locally first and only falls through
//! to the attached [`Remote`] (the bus) when no local entry exists. The same
//! caller code therefore works in a single process and across a cluster.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use corebus_core::{Map, Res, Value};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::detached::DetachedPool;
use crate::error::{BootstrapError, InvocationError};
use crate::meta::Meta;
use crate::module::{Module, Registration};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Boxed handler body.
pub type Action = Arc<dyn Fn(Context) -> BoxFuture<'static, (Map, Res)> + Send + Sync>;

/// Declared argument of an entry. Stored for downstream validators; the
/// registry itself does not enforce it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Var {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub desc: String,
}

/// Argument schema keyed by argument name.
pub type Vars = BTreeMap<String, Var>;

/// Handler definition registered as a Method or a Service.
#[derive(Clone)]
pub struct Definition {
    pub desc: String,
    pub nullable: bool,
    pub args: Vars,
    /// Default settings, overlaid by per-call extras.
    pub setting: Map,
    pub action: Action,
}

impl Definition {
    /// Wraps an async handler.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Map, Res)> + Send + 'static,
    {
        Self {
            desc: String::new(),
            nullable: false,
            args: Vars::new(),
            setting: Map::new(),
            action: Arc::new(move |ctx: Context| -> BoxFuture<'static, (Map, Res)> {
                Box::pin(action(ctx))
            }),
        }
    }

    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    #[must_use]
    pub fn with_setting(mut self, setting: Map) -> Self {
        self.setting = setting;
        self
    }

    #[must_use]
    pub fn with_arg(mut self, name: impl Into<String>, var: Var) -> Self {
        self.args.insert(name.into(), var);
        self
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("desc", &self.desc)
            .field("nullable", &self.nullable)
            .field("args", &self.args)
            .field("setting", &self.setting)
            .finish_non_exhaustive()
    }
}

/// A named group of methods sharing default settings.
///
/// Each method is registered as the Method `{library}.{method}`. Calls made
/// through [`Context::library`] pass the library settings as per-call extras.
#[derive(Debug, Clone, Default)]
pub struct Library {
    pub desc: String,
    pub setting: Map,
    pub methods: BTreeMap<String, Definition>,
}

/// Whether an entry may be reached over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Method,
    Service,
}

/// An immutable, insert-once registry entry.
#[derive(Debug)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub def: Definition,
}

// ---------------------------------------------------------------------------
// Seams to the bus
// ---------------------------------------------------------------------------

/// Where calls go when nothing local matches. Implemented by the bus module.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Call-and-wait with a timeout.
    async fn request(&self, meta: &Meta, name: &str, payload: Map, timeout: Duration) -> (Map, Res);

    /// Broadcast to every subscriber of `name`.
    async fn publish(&self, meta: &Meta, name: &str, payload: Map) -> Result<(), InvocationError>;

    /// Deliver to exactly one subscriber of `name`.
    async fn enqueue(&self, meta: &Meta, name: &str, payload: Map) -> Result<(), InvocationError>;
}

/// What a bus driver may do with the local registry.
#[async_trait]
pub trait Host: Send + Sync {
    /// Runs a Service entry on behalf of a remote caller. Methods are never
    /// reachable this way. Returns `None` when no such Service exists.
    async fn serve(self: Arc<Self>, meta: Arc<Meta>, name: String, payload: Map) -> Option<(Map, Res)>;

    /// Runs fire-and-forget work on the runtime's detached pool.
    fn detach(&self, work: BoxFuture<'static, ()>);
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a handler sees for one call.
#[derive(Clone)]
pub struct Context {
    pub meta: Arc<Meta>,
    /// Name the entry was invoked under.
    pub name: String,
    pub entry: Arc<Entry>,
    /// Entry defaults overlaid by per-call extras.
    pub setting: Map,
    pub payload: Map,
    registry: Arc<Registry>,
}

impl Context {
    /// Calls another entry (local first, then bus) with this call's meta.
    pub async fn call(&self, name: &str, payload: Map) -> (Map, Res) {
        self.registry.invoke(Arc::clone(&self.meta), name, payload).await
    }

    /// Like [`Context::call`], but stores the result in the meta and returns
    /// only the payload. Read the result with [`Meta::take_result`].
    pub async fn invoke(&self, name: &str, payload: Map) -> Map {
        let (data, res) = self.call(name, payload).await;
        self.meta.set_result(res);
        data
    }

    /// Broadcasts an event over the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is not attached or submission fails.
    pub async fn publish(&self, name: &str, payload: Map) -> Result<(), InvocationError> {
        match self.registry.remote() {
            Some(remote) => remote.publish(&self.meta, name, payload).await,
            None => Err(InvocationError::BusNotReady),
        }
    }

    /// Queues work for exactly one subscriber over the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is not attached or submission fails.
    pub async fn enqueue(&self, name: &str, payload: Map) -> Result<(), InvocationError> {
        match self.registry.remote() {
            Some(remote) => remote.enqueue(&self.meta, name, payload).await,
            None => Err(InvocationError::BusNotReady),
        }
    }

    /// Returns a caller for the methods of a registered library.
    #[must_use]
    pub fn library(&self, name: &str) -> LibraryCall {
        self.registry.library(Arc::clone(&self.meta), name)
    }

    /// Reads a merged setting by key.
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.setting.get(key)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("setting", &self.setting)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Invokes the methods of one library with its settings applied.
pub struct LibraryCall {
    registry: Arc<Registry>,
    meta: Arc<Meta>,
    name: String,
    setting: Map,
}

impl LibraryCall {
    /// Adds per-call settings on top of the library defaults.
    #[must_use]
    pub fn with_setting(mut self, extra: &Map) -> Self {
        for (k, v) in extra {
            self.setting.insert(k.clone(), v.clone());
        }
        self
    }

    /// Invokes `{library}.{method}` locally. A missing method yields an
    /// `invoke.not_found` result; library methods never go to the bus.
    pub async fn call(&self, method: &str, payload: Map) -> (Map, Res) {
        let full = join_name(&self.name, &normalize_name(method));
        match self
            .registry
            .invoke_local(Arc::clone(&self.meta), &full, payload, &[&self.setting])
            .await
        {
            Some(out) => out,
            None => (Map::new(), InvocationError::NotFound(full).into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared name -> entry table.
///
/// Writes take the exclusive lock; lookups take the shared lock only long
/// enough to clone the entry `Arc`. Handlers never run under a lock.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    libraries: RwLock<HashMap<String, Arc<Library>>>,
    remote: RwLock<Option<Weak<dyn Remote>>>,
    detached: DetachedPool,
    call_timeout: Duration,
}

impl Registry {
    /// Creates an empty registry that forwards unresolved calls with the
    /// given timeout and runs detached work on `detached`.
    #[must_use]
    pub fn new(call_timeout: Duration, detached: DetachedPool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            libraries: RwLock::new(HashMap::new()),
            remote: RwLock::new(None),
            detached,
            call_timeout,
        }
    }

    /// Attaches the fallback for names with no local entry.
    ///
    /// Held weakly; the registry never keeps the bus alive.
    pub fn attach_remote(&self, remote: Weak<dyn Remote>) {
        *self.remote.write() = Some(remote);
    }

    fn remote(&self) -> Option<Arc<dyn Remote>> {
        self.remote.read().as_ref().and_then(Weak::upgrade)
    }

    /// The pool used for fire-and-forget work.
    #[must_use]
    pub fn detached(&self) -> &DetachedPool {
        &self.detached
    }

    /// Registers a local-only entry.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty or already registered.
    pub fn register_method(&self, name: &str, def: Definition) -> Result<(), BootstrapError> {
        self.insert(name, EntryKind::Method, def)
    }

    /// Registers an entry that is also reachable over the bus.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty or already registered.
    pub fn register_service(&self, name: &str, def: Definition) -> Result<(), BootstrapError> {
        self.insert(name, EntryKind::Service, def)
    }

    fn insert(&self, name: &str, kind: EntryKind, def: Definition) -> Result<(), BootstrapError> {
        let label = match kind {
            EntryKind::Method => "method",
            EntryKind::Service => "service",
        };
        if name.is_empty() {
            return Err(BootstrapError::InvalidName { kind: label });
        }

        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(BootstrapError::Duplicate {
                kind: label,
                name: name.to_string(),
            });
        }
        entries.insert(
            name.to_string(),
            Arc::new(Entry {
                name: name.to_string(),
                kind,
                def,
            }),
        );
        Ok(())
    }

    /// Registers every method of `library` as `{name}.{method}`.
    ///
    /// Names are trimmed, lowercased and stripped of surrounding dots.
    ///
    /// # Errors
    ///
    /// Fails if the library name is empty or taken, or a method name collides.
    pub fn register_library(&self, name: &str, library: Library) -> Result<(), BootstrapError> {
        let prefix = normalize_name(name);
        if prefix.is_empty() {
            return Err(BootstrapError::InvalidName { kind: "library" });
        }
        {
            let mut libraries = self.libraries.write();
            if libraries.contains_key(&prefix) {
                return Err(BootstrapError::Duplicate {
                    kind: "library",
                    name: prefix,
                });
            }
            libraries.insert(prefix.clone(), Arc::new(library.clone()));
        }

        for (key, def) in library.methods {
            let key = normalize_name(&key);
            if key.is_empty() {
                continue;
            }
            self.register_method(&join_name(&prefix, &key), def)?;
        }
        Ok(())
    }

    /// Looks up an entry by name.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries.read().get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Names of all Service entries, sorted.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .values()
            .filter(|e| e.kind == EntryKind::Service)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolves `name` locally, falling back to the bus with the default
    /// call timeout. Never retries.
    pub async fn invoke(self: &Arc<Self>, meta: Arc<Meta>, name: &str, payload: Map) -> (Map, Res) {
        if let Some(entry) = self.entry(name) {
            return self.dispatch(entry, meta, name, payload, &[]).await;
        }

        let Some(remote) = self.remote() else {
            return (Map::new(), InvocationError::BusNotReady.into());
        };
        tracing::debug!(name, "no local entry, forwarding to bus");
        remote.request(&meta, name, payload, self.call_timeout).await
    }

    /// Runs a local entry if one exists. `extras` are overlaid on the entry's
    /// default settings in order. Returns `None` without side effects when
    /// nothing is registered under `name`.
    pub async fn invoke_local(
        self: &Arc<Self>,
        meta: Arc<Meta>,
        name: &str,
        payload: Map,
        extras: &[&Map],
    ) -> Option<(Map, Res)> {
        let entry = self.entry(name)?;
        Some(self.dispatch(entry, meta, name, payload, extras).await)
    }

    async fn dispatch(
        self: &Arc<Self>,
        entry: Arc<Entry>,
        meta: Arc<Meta>,
        name: &str,
        payload: Map,
        extras: &[&Map],
    ) -> (Map, Res) {
        let mut setting = entry.def.setting.clone();
        for extra in extras {
            for (k, v) in *extra {
                setting.insert(k.clone(), v.clone());
            }
        }

        let action = Arc::clone(&entry.def.action);
        let ctx = Context {
            meta,
            name: name.to_string(),
            entry,
            setting,
            payload,
            registry: Arc::clone(self),
        };
        action(ctx).await
    }

    /// Returns a caller for a library's methods.
    #[must_use]
    pub fn library(self: &Arc<Self>, meta: Arc<Meta>, name: &str) -> LibraryCall {
        let name = normalize_name(name);
        let setting = self
            .libraries
            .read()
            .get(&name)
            .map(|lib| lib.setting.clone())
            .unwrap_or_default();
        LibraryCall {
            registry: Arc::clone(self),
            meta,
            name,
            setting,
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Host for Registry {
    async fn serve(self: Arc<Self>, meta: Arc<Meta>, name: String, payload: Map) -> Option<(Map, Res)> {
        let entry = self.entry(&name).filter(|e| e.kind == EntryKind::Service)?;
        Some(self.dispatch(entry, meta, &name, payload, &[]).await)
    }

    fn detach(&self, work: BoxFuture<'static, ()>) {
        self.detached.spawn(work);
    }
}

#[async_trait]
impl Module for Registry {
    fn name(&self) -> &'static str {
        "core"
    }

    fn register(&self, name: &str, value: &Registration) -> anyhow::Result<()> {
        match value {
            Registration::Method(def) => self.register_method(name, def.clone())?,
            Registration::Service(def) => self.register_service(name, def.clone())?,
            Registration::Library(lib) => self.register_library(name, lib.clone())?,
            _ => {}
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        tracing::info!(entries = self.len(), "core registry is running");
        Ok(())
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_string()
}

fn join_name(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}.{key}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
