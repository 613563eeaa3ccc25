//! Side-channel store for values one control function derives and a later one consumes.
//!
//! Last write wins. Nothing expires on its own: a producer that stops publishing
//! must `clear` its key, otherwise consumers keep seeing the previous value.

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConfigValue {
    Int32(i32),
    Text(String),
    Flag(bool),
}

impl ConfigValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigValue::Int32(_) => "i32",
            ConfigValue::Text(_) => "string",
            ConfigValue::Flag(_) => "bool",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    values: FxHashMap<&'static str, ConfigValue>,
    kinds: FxHashMap<&'static str, &'static str>,
}

impl ConfigStore {
    pub fn new() -> Self { Self::default() }

    pub fn set_config_i32(&mut self, key: &'static str, value: i32) -> Result<(), EngineError> {
        self.put(key, ConfigValue::Int32(value))
    }

    pub fn get_config_i32(&self, key: &'static str) -> Result<Option<i32>, EngineError> {
        match self.lookup(key, "i32")? {
            Some(ConfigValue::Int32(v)) => Ok(Some(*v)),
            _ => Ok(None),
        }
    }

    pub fn set_config_str(&mut self, key: &'static str, value: impl Into<String>) -> Result<(), EngineError> {
        self.put(key, ConfigValue::Text(value.into()))
    }

    pub fn get_config_str(&self, key: &'static str) -> Result<Option<&str>, EngineError> {
        match self.lookup(key, "string")? {
            Some(ConfigValue::Text(v)) => Ok(Some(v.as_str())),
            _ => Ok(None),
        }
    }

    pub fn set_config_bool(&mut self, key: &'static str, value: bool) -> Result<(), EngineError> {
        self.put(key, ConfigValue::Flag(value))
    }

    pub fn get_config_bool(&self, key: &'static str) -> Result<Option<bool>, EngineError> {
        match self.lookup(key, "bool")? {
            Some(ConfigValue::Flag(v)) => Ok(Some(*v)),
            _ => Ok(None),
        }
    }

    /// Remove a published value. Returns whether one was present.
    pub fn clear(&mut self, key: &'static str) -> bool { self.values.remove(key).is_some() }

    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Current values sorted by key.
    pub fn entries(&self) -> Vec<(&'static str, &ConfigValue)> {
        let mut out: Vec<_> = self.values.iter().map(|(k, v)| (*k, v)).collect();
        out.sort_unstable_by_key(|(k, _)| *k);
        out
    }

    fn put(&mut self, key: &'static str, value: ConfigValue) -> Result<(), EngineError> {
        let kind = value.kind();
        match self.kinds.get(key).copied() {
            Some(pinned) if pinned != kind => return Err(EngineError::mismatch(key, pinned, kind)),
            Some(_) => {}
            None => {
                self.kinds.insert(key, kind);
            }
        }
        self.values.insert(key, value);
        Ok(())
    }

    fn lookup(&self, key: &'static str, expected: &'static str) -> Result<Option<&ConfigValue>, EngineError> {
        match self.kinds.get(key).copied() {
            Some(pinned) if pinned != expected => Err(EngineError::mismatch(key, expected, pinned)),
            _ => Ok(self.values.get(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins() {
        let mut cfg = ConfigStore::new();
        cfg.set_config_i32("replicas", 1).unwrap();
        cfg.set_config_i32("replicas", 3).unwrap();
        assert_eq!(cfg.get_config_i32("replicas").unwrap(), Some(3));
        assert_eq!(cfg.len(), 1);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let cfg = ConfigStore::new();
        assert_eq!(cfg.get_config_i32("replicas").unwrap(), None);
        assert_eq!(cfg.get_config_str("name").unwrap(), None);
    }

    #[test]
    fn values_persist_until_cleared() {
        let mut cfg = ConfigStore::new();
        cfg.set_config_str("cluster", "foo").unwrap();
        assert_eq!(cfg.get_config_str("cluster").unwrap(), Some("foo"));
        assert!(cfg.clear("cluster"));
        assert!(!cfg.clear("cluster"));
        assert_eq!(cfg.get_config_str("cluster").unwrap(), None);
    }

    #[test]
    fn kind_is_pinned_per_key() {
        let mut cfg = ConfigStore::new();
        cfg.set_config_i32("replicas", 2).unwrap();
        assert!(cfg.set_config_str("replicas", "two").is_err());
        assert!(cfg.get_config_bool("replicas").is_err());
        cfg.clear("replicas");
        assert!(cfg.set_config_bool("replicas", true).is_err());
    }
}
