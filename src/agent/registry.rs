//! Registry of agent kinds.
//!
//! Maps a kind name to a constructor, so agent sets can be described in a
//! YAML file and built at startup:
//!
//! ```yaml
//! agents:
//!   - key: cache/us-east-1
//!     kind: sleep
//!     interval_ms: 30000
//!     params:
//!       duration_ms: 250
//!   - key: poller/build-42
//!     kind: flaky
//!     params:
//!       fail_every: 3
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Agent, FlakyAgent, NoopAgent, SleepAgent};
use crate::error::RegistryError;
use crate::store::is_valid_agent_key;

/// One agent entry in a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub key: String,
    pub kind: String,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl AgentDefinition {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    /// Reads an unsigned integer parameter, or `default` when absent.
    pub fn param_u64(&self, name: &str, default: u64) -> Result<u64, RegistryError> {
        match self.params.get(name) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| RegistryError::InvalidDefinition {
                key: self.key.clone(),
                message: format!("parameter '{}' must be a non-negative integer", name),
            }),
        }
    }

    pub fn param_bool(&self, name: &str, default: bool) -> Result<bool, RegistryError> {
        match self.params.get(name) {
            None => Ok(default),
            Some(value) => value.as_bool().ok_or_else(|| RegistryError::InvalidDefinition {
                key: self.key.clone(),
                message: format!("parameter '{}' must be a boolean", name),
            }),
        }
    }
}

/// Top-level shape of an agent definition file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentFile {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

/// Builds an agent from its definition.
pub type AgentConstructor =
    Arc<dyn Fn(&AgentDefinition) -> Result<Arc<dyn Agent>, RegistryError> + Send + Sync>;

/// Kind name to constructor table.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    kinds: HashMap<String, AgentConstructor>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry knowing `noop`, `sleep` and `flaky`.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry.register_kind("noop", |def| {
            let mut agent = NoopAgent::new(&def.key);
            if let Some(interval) = def.interval() {
                agent = agent.with_interval(interval);
            }
            Ok(Arc::new(agent) as Arc<dyn Agent>)
        });
        registry.register_kind("sleep", |def| {
            let duration = Duration::from_millis(def.param_u64("duration_ms", 100)?);
            let mut agent = SleepAgent::new(&def.key, duration);
            if let Some(interval) = def.interval() {
                agent = agent.with_interval(interval);
            }
            Ok(Arc::new(agent) as Arc<dyn Agent>)
        });
        registry.register_kind("flaky", |def| {
            let mut agent = FlakyAgent::new(&def.key, def.param_u64("fail_every", 2)?);
            if def.param_bool("panic", false)? {
                agent = agent.panicking();
            }
            if let Some(interval) = def.interval() {
                agent = agent.with_interval(interval);
            }
            Ok(Arc::new(agent) as Arc<dyn Agent>)
        });
        registry
    }

    /// Adds or replaces the constructor for `kind`.
    pub fn register_kind<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&AgentDefinition) -> Result<Arc<dyn Agent>, RegistryError> + Send + Sync + 'static,
    {
        self.kinds.insert(kind.into(), Arc::new(constructor));
    }

    /// Known kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Builds a single agent.
    pub fn build(&self, def: &AgentDefinition) -> Result<Arc<dyn Agent>, RegistryError> {
        if !is_valid_agent_key(&def.key) {
            return Err(RegistryError::InvalidDefinition {
                key: def.key.clone(),
                message: "agent keys must be non-empty and not purely numeric".to_string(),
            });
        }
        let constructor = self
            .kinds
            .get(&def.kind)
            .ok_or_else(|| RegistryError::UnknownKind(def.kind.clone()))?;
        constructor(def)
    }

    /// Builds every agent of `file`, refusing duplicate keys.
    pub fn build_all(&self, file: &AgentFile) -> Result<Vec<Arc<dyn Agent>>, RegistryError> {
        let mut seen = HashSet::new();
        let mut agents = Vec::with_capacity(file.agents.len());
        for def in &file.agents {
            if !seen.insert(def.key.as_str()) {
                return Err(RegistryError::DuplicateKey(def.key.clone()));
            }
            agents.push(self.build(def)?);
        }
        Ok(agents)
    }

    /// Parses YAML agent definitions and builds them.
    pub fn load_str(&self, yaml: &str) -> Result<Vec<Arc<dyn Agent>>, RegistryError> {
        let file: AgentFile = serde_yaml::from_str(yaml)?;
        self.build_all(&file)
    }

    /// Reads and builds a YAML agent definition file.
    pub fn load_file(&self, path: &Path) -> Result<Vec<Arc<dyn Agent>>, RegistryError> {
        let contents = std::fs::read_to_string(path)?;
        self.load_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const AGENTS_YAML: &str = r#"
agents:
  - key: cache/us-east-1
    kind: sleep
    interval_ms: 30000
    params:
      duration_ms: 5
  - key: poller/build-42
    kind: flaky
    params:
      fail_every: 3
      panic: true
  - key: heartbeat
    kind: noop
"#;

    #[test]
    fn test_load_builtin_kinds() {
        let registry = AgentRegistry::with_builtin_kinds();
        assert_eq!(registry.kinds(), vec!["flaky", "noop", "sleep"]);

        let agents = registry.load_str(AGENTS_YAML).unwrap();
        let keys: Vec<&str> = agents.iter().map(|a| a.key()).collect();
        assert_eq!(keys, vec!["cache/us-east-1", "poller/build-42", "heartbeat"]);
        assert_eq!(agents[0].interval(), Some(Duration::from_secs(30)));
        assert_eq!(agents[2].interval(), None);
    }

    #[test]
    fn test_unknown_kind() {
        let registry = AgentRegistry::with_builtin_kinds();
        let err = registry
            .load_str("agents:\n  - key: a\n    kind: ftp\n")
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::UnknownKind(kind) if kind == "ftp"));
    }

    #[test]
    fn test_duplicate_key() {
        let registry = AgentRegistry::with_builtin_kinds();
        let yaml = "agents:\n  - key: a\n    kind: noop\n  - key: a\n    kind: noop\n";
        let err = registry.load_str(yaml).err().unwrap();
        assert!(matches!(err, RegistryError::DuplicateKey(key) if key == "a"));
    }

    #[test]
    fn test_invalid_definitions() {
        let registry = AgentRegistry::with_builtin_kinds();

        let numeric = registry.load_str("agents:\n  - key: \"42\"\n    kind: noop\n");
        assert!(matches!(
            numeric.err().unwrap(),
            RegistryError::InvalidDefinition { .. }
        ));

        let bad_param = registry
            .load_str("agents:\n  - key: a\n    kind: sleep\n    params:\n      duration_ms: soon\n");
        assert!(matches!(
            bad_param.err().unwrap(),
            RegistryError::InvalidDefinition { .. }
        ));
    }

    #[test]
    fn test_custom_kind() {
        let mut registry = AgentRegistry::new();
        registry.register_kind("custom", |def| Ok(Arc::new(NoopAgent::new(&def.key)) as Arc<dyn Agent>));
        let agents = registry.load_str("agents:\n  - key: x\n    kind: custom\n").unwrap();
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(AGENTS_YAML.as_bytes()).unwrap();

        let registry = AgentRegistry::with_builtin_kinds();
        let agents = registry.load_file(file.path()).unwrap();
        assert_eq!(agents.len(), 3);

        let missing = registry.load_file(Path::new("/nonexistent/agents.yaml"));
        assert!(matches!(missing.err().unwrap(), RegistryError::Io(_)));
    }
}
