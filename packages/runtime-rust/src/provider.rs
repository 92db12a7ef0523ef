//! Named factories for shared resources.
//!
//! A [`Provider`] builds a value (a client, a pool, a cache handle) from a
//! setting map. Providers are registered by name and looked up with
//! [`ProviderModule::use_provider`], which downcasts the built value to the
//! type the caller expects.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use corebus_core::Map;
use parking_lot::RwLock;

use crate::error::{BootstrapError, ProviderError};
use crate::module::{Module, Registration};

/// Type-erased value built by a provider.
pub type Provided = Arc<dyn Any + Send + Sync>;

/// Builds a resource from a setting map.
pub trait Provider: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns an error if the resource cannot be built from `setting`.
    fn provide(&self, setting: &Map) -> anyhow::Result<Provided>;
}

impl<F> Provider for F
where
    F: Fn(&Map) -> anyhow::Result<Provided> + Send + Sync + 'static,
{
    fn provide(&self, setting: &Map) -> anyhow::Result<Provided> {
        self(setting)
    }
}

/// Name -> provider table.
#[derive(Default)]
pub struct ProviderModule {
    providers: RwLock<BTreeMap<String, Arc<dyn Provider>>>,
}

impl ProviderModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under `name`.
    ///
    /// # Errors
    ///
    /// Fails on an empty name or a name already taken.
    pub fn register_provider(
        &self,
        name: &str,
        provider: Arc<dyn Provider>,
    ) -> Result<(), BootstrapError> {
        if name.is_empty() {
            return Err(BootstrapError::InvalidName { kind: "provider" });
        }
        let mut providers = self.providers.write();
        if providers.contains_key(name) {
            return Err(BootstrapError::Duplicate {
                kind: "provider",
                name: name.to_string(),
            });
        }
        providers.insert(name.to_string(), provider);
        tracing::debug!(provider = name, "provider registered");
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Builds the resource named `name` without checking its type.
    ///
    /// # Errors
    ///
    /// [`ProviderError::NotRegistered`] for an unknown name,
    /// [`ProviderError::Build`] when the provider fails.
    pub fn use_any(&self, name: &str, setting: &Map) -> Result<Provided, ProviderError> {
        // Build outside the lock; a provider may itself look up others.
        let provider = self
            .providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotRegistered(name.to_string()))?;
        provider.provide(setting).map_err(|e| ProviderError::Build {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })
    }

    /// Builds the resource named `name` and downcasts it to `T`.
    ///
    /// # Errors
    ///
    /// As [`use_any`](Self::use_any), plus [`ProviderError::TypeMismatch`]
    /// when the built value is not a `T`.
    pub fn use_provider<T>(&self, name: &str, setting: &Map) -> Result<Arc<T>, ProviderError>
    where
        T: Any + Send + Sync,
    {
        self.use_any(name, setting)?
            .downcast::<T>()
            .map_err(|_| ProviderError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }
}

impl fmt::Debug for ProviderModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderModule")
            .field("providers", &self.providers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Module for ProviderModule {
    fn name(&self) -> &'static str {
        "provider"
    }

    fn register(&self, name: &str, value: &Registration) -> anyhow::Result<()> {
        if let Registration::Provider(provider) = value {
            self.register_provider(name, Arc::clone(provider))?;
        }
        Ok(())
    }
}
