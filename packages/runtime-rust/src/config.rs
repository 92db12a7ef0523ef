//! Runtime configuration and configuration sources.

use std::path::PathBuf;
use std::time::Duration;

use corebus_core::{Map, Value};

/// Default timeout applied when a call falls through to the bus.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity and free-form settings of a runtime instance.
///
/// Merged from the configuration map registered before bootstrap; frozen
/// once setup begins.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Application name.
    pub name: String,
    /// Deployment role of this process.
    pub role: String,
    /// Node identifier within a deployment.
    pub node: String,
    /// Application version string.
    pub version: String,
    /// Arbitrary settings, merged key by key.
    pub setting: Map,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "corebus".to_string(),
            role: "corebus".to_string(),
            node: String::new(),
            version: String::new(),
            setting: Map::new(),
        }
    }
}

impl RuntimeConfig {
    /// Merges a configuration map into this config.
    ///
    /// `name` and `node` only apply when non-empty; `role` and `version`
    /// apply as given; `setting` entries overwrite existing keys.
    pub fn merge(&mut self, cfg: &Map) {
        if let Some(name) = str_field(cfg, "name").filter(|s| !s.is_empty()) {
            self.name = name.to_string();
        }
        if let Some(role) = str_field(cfg, "role") {
            self.role = role.to_string();
        }
        if let Some(node) = str_field(cfg, "node").filter(|s| !s.is_empty()) {
            self.node = node.to_string();
        }
        if let Some(version) = str_field(cfg, "version") {
            self.version = version.to_string();
        }
        if let Some(Value::Object(setting)) = cfg.get("setting") {
            for (k, v) in setting {
                self.setting.insert(k.clone(), v.clone());
            }
        }
    }
}

fn str_field<'a>(cfg: &'a Map, key: &str) -> Option<&'a str> {
    cfg.get(key).and_then(Value::as_str)
}

/// Tunables of the runtime itself, fixed at construction.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Timeout for calls forwarded to the bus by `invoke`.
    pub default_call_timeout: Duration,
    /// Upper bound on concurrently running detached tasks.
    pub max_detached_tasks: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            default_call_timeout: DEFAULT_CALL_TIMEOUT,
            max_detached_tasks: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration sources
// ---------------------------------------------------------------------------

/// Produces the configuration map merged into the runtime at bootstrap.
pub trait ConfigSource: Send + Sync {
    /// Loads the configuration map.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or parsed.
    fn load_config(&self) -> anyhow::Result<Map>;
}

/// A fixed, in-memory configuration map.
#[derive(Debug, Clone, Default)]
pub struct MapSource(pub Map);

impl ConfigSource for MapSource {
    fn load_config(&self) -> anyhow::Result<Map> {
        Ok(self.0.clone())
    }
}

/// Reads a JSON document from disk. The top level must be an object.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileSource {
    fn load_config(&self) -> anyhow::Result<Map> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {e}", self.path.display())
        })?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!(
                "config file {} must contain an object, found {}",
                self.path.display(),
                kind_of(&other)
            ),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.name, "corebus");
        assert_eq!(config.role, "corebus");
        assert!(config.node.is_empty());
        assert!(config.setting.is_empty());
    }

    #[test]
    fn options_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.default_call_timeout, Duration::from_secs(5));
        assert_eq!(options.max_detached_tasks, 1024);
    }

    #[test]
    fn merge_applies_identity_and_settings() {
        let mut config = RuntimeConfig::default();
        config.merge(&map(json!({
            "name": "orders",
            "role": "api",
            "node": "n1",
            "version": "1.2.0",
            "setting": {"region": "eu", "limit": 10}
        })));
        config.merge(&map(json!({"setting": {"limit": 20}})));

        assert_eq!(config.name, "orders");
        assert_eq!(config.role, "api");
        assert_eq!(config.node, "n1");
        assert_eq!(config.version, "1.2.0");
        assert_eq!(config.setting["region"], json!("eu"));
        assert_eq!(config.setting["limit"], json!(20));
    }

    #[test]
    fn merge_ignores_empty_name_and_node() {
        let mut config = RuntimeConfig::default();
        config.merge(&map(json!({"name": "", "node": "", "role": ""})));
        assert_eq!(config.name, "corebus");
        assert!(config.node.is_empty());
        assert!(config.role.is_empty());
    }

    #[test]
    fn file_source_reads_json_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "billing", "bus": {{"driver": "default"}}}}"#).unwrap();

        let cfg = FileSource::new(file.path()).load_config().unwrap();
        assert_eq!(cfg["name"], json!("billing"));
        assert_eq!(cfg["bus"]["driver"], json!("default"));
    }

    #[test]
    fn file_source_rejects_non_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2, 3]").unwrap();

        let err = FileSource::new(file.path()).load_config().unwrap_err();
        assert!(err.to_string().contains("must contain an object"));
    }

    #[test]
    fn file_source_missing_file_errors() {
        let err = FileSource::new("/nonexistent/corebus.json").load_config().unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn map_source_returns_clone() {
        let source = MapSource(map(json!({"name": "x"})));
        assert_eq!(source.load_config().unwrap()["name"], json!("x"));
    }
}
