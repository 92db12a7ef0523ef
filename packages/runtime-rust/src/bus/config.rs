//! Bus configuration and the per-connection instance handed to drivers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use corebus_core::{Map, Value};
use serde::{Deserialize, Serialize};

use crate::registry::Host;

/// Name used when a driver or config is registered without one.
pub const DEFAULT_NAME: &str = "default";

fn default_driver() -> String {
    DEFAULT_NAME.to_string()
}

fn default_weight() -> i64 {
    1
}

/// One named bus binding: which driver to use, how much traffic it takes,
/// and the subject prefix it lives under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Relative share of outgoing requests. 0 becomes 1 at setup; a negative
    /// weight keeps the connection open but never selects it.
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub prefix: String,
    /// Driver-specific settings (urls, credentials, queue group, ...).
    #[serde(default)]
    pub setting: Map,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            weight: default_weight(),
            prefix: String::new(),
            setting: Map::new(),
        }
    }
}

impl BusConfig {
    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.setting.insert(key.into(), value);
        self
    }

    /// Fills in a missing driver and an unset (zero) weight.
    pub(crate) fn normalize(&mut self) {
        if self.driver.is_empty() {
            self.driver = default_driver();
        }
        if self.weight == 0 {
            self.weight = default_weight();
        }
    }

    /// First non-empty string setting among `keys`.
    #[must_use]
    pub fn setting_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.setting.get(*k).and_then(Value::as_str))
            .find(|s| !s.is_empty())
    }
}

/// Parses the `bus` section of the runtime config.
///
/// Accepts either one config object, registered as `default`, or an object
/// of named configs.
///
/// # Errors
///
/// Returns an error if the section has the wrong shape.
pub fn parse_section(section: &Value) -> Result<BTreeMap<String, BusConfig>, serde_json::Error> {
    const SINGLE_KEYS: [&str; 4] = ["driver", "weight", "prefix", "setting"];

    let is_single = section
        .as_object()
        .is_some_and(|obj| obj.keys().any(|k| SINGLE_KEYS.contains(&k.as_str())));
    if is_single {
        let cfg: BusConfig = serde_json::from_value(section.clone())?;
        return Ok(BTreeMap::from([(DEFAULT_NAME.to_string(), cfg)]));
    }
    serde_json::from_value(section.clone())
}

/// What a driver receives when asked to connect one bus config.
#[derive(Clone)]
pub struct BusInstance {
    pub name: String,
    pub config: BusConfig,
    /// The local registry, for serving inbound calls.
    pub host: Arc<dyn Host>,
}

impl fmt::Debug for BusInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInstance")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = BusConfig::default();
        assert_eq!(cfg.driver, "default");
        assert_eq!(cfg.weight, 1);
        assert!(cfg.prefix.is_empty());
    }

    #[test]
    fn normalize_fixes_driver_and_zero_weight() {
        let mut cfg = BusConfig::default().with_driver("").with_weight(0);
        cfg.normalize();
        assert_eq!(cfg.driver, "default");
        assert_eq!(cfg.weight, 1);

        let mut cfg = BusConfig::default().with_weight(4);
        cfg.normalize();
        assert_eq!(cfg.weight, 4);
    }

    #[test]
    fn normalize_keeps_negative_weight() {
        let mut cfg = BusConfig::default().with_weight(-3);
        cfg.normalize();
        assert_eq!(cfg.weight, -3);
    }

    #[test]
    fn single_section_becomes_default() {
        let parsed = parse_section(&json!({"driver": "nats", "prefix": "app."})).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["default"].driver, "nats");
        assert_eq!(parsed["default"].prefix, "app.");
        assert_eq!(parsed["default"].weight, 1);
    }

    #[test]
    fn named_section_keeps_names() {
        let parsed = parse_section(&json!({
            "primary": {"weight": 3},
            "backup": {"driver": "nats", "setting": {"url": "nats://b:4222"}}
        }))
        .unwrap();
        assert_eq!(parsed["primary"].weight, 3);
        assert_eq!(parsed["primary"].driver, "default");
        assert_eq!(parsed["backup"].setting_str(&["server", "url"]), Some("nats://b:4222"));
    }

    #[test]
    fn malformed_section_is_an_error() {
        assert!(parse_section(&json!({"weight": "heavy"})).is_err());
        assert!(parse_section(&json!([1, 2])).is_err());
    }

    fn config_name() -> impl Strategy<Value = String> {
        "[a-z]{1,8}".prop_filter("not a single-config key", |name| {
            !["driver", "weight", "prefix", "setting"].contains(&name.as_str())
        })
    }

    proptest! {
        #[test]
        fn named_sections_parse_every_entry(
            entries in proptest::collection::btree_map(config_name(), (-5i64..10, "[a-z.]{0,6}"), 0..6)
        ) {
            let section: serde_json::Map<String, Value> = entries
                .iter()
                .map(|(name, (weight, prefix))| {
                    (name.clone(), json!({"weight": weight, "prefix": prefix}))
                })
                .collect();

            let parsed = parse_section(&Value::Object(section)).unwrap();
            prop_assert_eq!(parsed.len(), entries.len());
            for (name, (weight, prefix)) in &entries {
                let cfg = &parsed[name];
                prop_assert_eq!(cfg.weight, *weight);
                prop_assert_eq!(&cfg.prefix, prefix);
                prop_assert_eq!(cfg.driver.as_str(), DEFAULT_NAME);
            }
        }

        #[test]
        fn normalize_only_touches_zero_weight(weight in -100i64..100) {
            let mut cfg = BusConfig::default().with_weight(weight);
            cfg.normalize();
            prop_assert_eq!(cfg.weight, if weight == 0 { 1 } else { weight });
        }
    }
}
