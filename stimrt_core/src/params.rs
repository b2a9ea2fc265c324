//! Property store mutated by `set-property` messages
//!
//! Each process keeps its own copy; the Controller seeds it from the
//! participant's configuration and peers update it by message.

use crate::error::StimResult;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Shared key-value property store
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// BTreeMap keeps keys sorted for stable dumps
    params: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(initial: BTreeMap<String, Value>) -> Self {
        Self {
            params: Arc::new(RwLock::new(initial)),
        }
    }

    /// Get a parameter value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let params = self.params.read();
        let value = params.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Get parameter with default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_or(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_or(key, default)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_or(key, default.to_string())
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.params.read().get(key).cloned()
    }

    /// Set a parameter value, returning the previous one
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> StimResult<Option<Value>> {
        let json_value = serde_json::to_value(value)?;
        Ok(self.params.write().insert(key.to_string(), json_value))
    }

    pub fn get_all(&self) -> BTreeMap<String, Value> {
        self.params.read().clone()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.params.read().keys().cloned().collect()
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.params.write().remove(key)
    }

    /// Save parameters to a YAML file
    pub fn save_to_disk(&self, path: &Path) -> StimResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(&*self.params.read())?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge parameters from a YAML file, if it exists
    pub fn load_from_disk(&self, path: &Path) -> StimResult<()> {
        if path.exists() {
            let yaml_str = std::fs::read_to_string(path)?;
            let loaded: BTreeMap<String, Value> = serde_yaml::from_str(&yaml_str)?;
            self.params.write().extend(loaded);
        }
        Ok(())
    }
}
