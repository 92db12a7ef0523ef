//! corebus runtime: a modular service runtime.
//!
//! Modules register into a [`Runtime`], which drives them through setup,
//! open, start, stop and close. The core [`Registry`] resolves calls by name,
//! locally first and over the message bus otherwise. The bus multiplexes
//! named transport connections behind a weighted selector, and triggers fire
//! handlers on lifecycle events. Providers build named shared resources.

pub mod bus;
pub mod config;
pub mod detached;
pub mod error;
pub mod meta;
pub mod module;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod signals;
pub mod trigger;

pub use bus::{BusConfig, BusInstance, BusModule, Connection, Driver, InprocDriver, ServiceStats};
pub use config::{ConfigSource, FileSource, MapSource, RuntimeConfig, RuntimeOptions};
pub use corebus_core::{Map, Metadata, Res, Value};
pub use detached::DetachedPool;
pub use error::{BootstrapError, InvocationError, ProtocolError, ProviderError, TransportError};
pub use meta::Meta;
pub use module::{Module, Registration};
pub use provider::{Provided, Provider, ProviderModule};
pub use registry::{Context, Definition, Entry, EntryKind, Host, Library, Registry, Remote, Var};
pub use runtime::Runtime;
pub use trigger::{Trigger, TriggerModule};
