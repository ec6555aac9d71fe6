//! Key-value storage contract
//!
//! Every key is an area prefix plus an identifier:
//!
//! | Area      | Prefix  | Identifier | Value                          |
//! |-----------|---------|------------|--------------------------------|
//! | `Script`  | `scr:`  | script id  | [`ScriptRecord`] JSON          |
//! | `Code`    | `code:` | script id  | source text                    |
//! | `Value`   | `val:`  | script id  | object of persisted values     |
//! | `Require` | `req:`  | URL        | library source text            |
//! | `Cache`   | `cac:`  | URL        | `<mime type>,<base64 payload>` |
//! | `Mod`     | `mod:`  | URL        | update-check marker            |
//!
//! [`ScriptRecord`]: sw_core::ScriptRecord

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;

// =============================================================================
// Areas and keys
// =============================================================================

/// Storage area of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Script,
    Code,
    Value,
    Require,
    Cache,
    Mod,
}

impl Area {
    pub const ALL: [Area; 6] = [
        Area::Script,
        Area::Code,
        Area::Value,
        Area::Require,
        Area::Cache,
        Area::Mod,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Area::Script => "scr:",
            Area::Code => "code:",
            Area::Value => "val:",
            Area::Require => "req:",
            Area::Cache => "cac:",
            Area::Mod => "mod:",
        }
    }

    /// Build the storage key for an identifier in this area.
    #[inline]
    pub fn key(self, id: impl std::fmt::Display) -> String {
        format!("{}{}", self.prefix(), id)
    }

    /// Split a storage key into its area and identifier.
    pub fn parse(key: &str) -> Option<(Area, &str)> {
        Self::ALL
            .iter()
            .find_map(|area| key.strip_prefix(area.prefix()).map(|id| (*area, id)))
    }

    /// True for areas whose identifier is a script id rather than a URL.
    pub fn is_per_script(self) -> bool {
        matches!(self, Area::Script | Area::Code | Area::Value)
    }
}

// =============================================================================
// Storage trait
// =============================================================================

/// Namespaced key-value backend.
///
/// Missing keys are simply absent from returned maps.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError>;

    /// Full dump of the store, used at startup and by the vacuum sweep.
    async fn get_all(&self) -> Result<HashMap<String, Value>, StorageError>;

    async fn set_many(&self, entries: HashMap<String, Value>) -> Result<(), StorageError>;

    async fn remove_many(&self, keys: &[String]) -> Result<(), StorageError>;

    async fn get_one(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut found = self.get_many(&[key.to_string()]).await?;
        Ok(found.remove(key))
    }

    async fn set_one(&self, key: String, value: Value) -> Result<(), StorageError> {
        self.set_many(HashMap::from([(key, value)])).await
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Storage held in process memory.
///
/// Backs tests and the CLI, which loads and saves it as a flat JSON object.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `{ "<key>": <value> }` JSON object.
    pub fn from_json(json: Value) -> Result<Self, StorageError> {
        match json {
            Value::Object(map) => Ok(Self {
                data: RwLock::new(map.into_iter().collect()),
            }),
            Value::Null => Ok(Self::default()),
            other => Err(StorageError::InvalidValue {
                key: String::new(),
                message: format!("expected a JSON object, found {}", json_kind(&other)),
            }),
        }
    }

    /// Dump as a `{ "<key>": <value> }` JSON object with sorted keys.
    pub fn to_json(&self) -> Value {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Value::Object(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn keys(&self) -> Vec<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, StorageError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn get_all(&self) -> Result<HashMap<String, Value>, StorageError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn set_many(&self, entries: HashMap<String, Value>) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.extend(entries);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}

/// Approximate in-storage size of a value: the length of its JSON text,
/// or of the string itself for string values.
pub fn deep_size(value: Option<&Value>) -> u64 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::String(s)) => s.len() as u64,
        Some(other) => serde_json::to_string(other).map_or(0, |s| s.len() as u64),
    }
}
