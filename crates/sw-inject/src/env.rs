//! Script environments
//!
//! An environment is everything a group of scripts needs from storage to
//! run: code, required libraries, cached resources and stored values. The
//! scripts matched for a frame are split into an early environment (start
//! and body scripts) and a delayed one (end and idle scripts).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use sw_core::url::{decode_data_uri, is_data_uri};
use sw_core::ScriptRecord;
use sw_store::{Area, Storage, StorageError};

/// Storage data an environment depends on.
///
/// Kept beside cached bags so storage changes can find the bags they affect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvKeys {
    /// Scripts whose code is read
    pub ids: Vec<u64>,
    /// Absolute `@require` URLs
    pub req_keys: Vec<String>,
    /// Absolute `@resource` URLs
    pub cache_keys: Vec<String>,
    /// Scripts whose values are read
    pub value_ids: Vec<u64>,
}

impl EnvKeys {
    /// Every storage key to read for this environment.
    pub fn storage_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(
            self.ids.len() + self.req_keys.len() + self.cache_keys.len() + self.value_ids.len(),
        );
        keys.extend(self.ids.iter().map(|id| Area::Code.key(id)));
        keys.extend(self.req_keys.iter().map(|url| Area::Require.key(url)));
        keys.extend(self.cache_keys.iter().map(|url| Area::Cache.key(url)));
        keys.extend(self.value_ids.iter().map(|id| Area::Value.key(id)));
        keys
    }

    /// True when a change to `area`/`id` affects this environment.
    pub fn depends_on(&self, area: Area, id: &str) -> bool {
        match area {
            Area::Require => self.req_keys.iter().any(|url| url == id),
            Area::Cache => self.cache_keys.iter().any(|url| url == id),
            Area::Value => self.value_ids.iter().any(|v| v.to_string() == id),
            Area::Code => self.ids.iter().any(|v| v.to_string() == id),
            Area::Script | Area::Mod => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ScriptEnv {
    pub scripts: Vec<ScriptRecord>,
    pub keys: EnvKeys,
    pub code: HashMap<u64, String>,
    /// Library text by absolute URL
    pub require: HashMap<String, String>,
    /// Resource payload by absolute URL
    pub cache: BTreeMap<String, String>,
    pub values: HashMap<u64, Value>,
    /// Storage key of each dependency -> scripts needing it
    dependents: HashMap<String, Vec<u64>>,
}

impl ScriptEnv {
    /// Register a script and its dependencies.
    ///
    /// Resources already listed in `shared_cache` are not read again.
    fn add(&mut self, script: ScriptRecord, shared_cache: Option<&[String]>) {
        let id = script.id();
        self.keys.ids.push(id);
        if script.meta.uses_values() {
            self.keys.value_ids.push(id);
        }

        for url in &script.meta.require {
            let full = script.resolve_url(url);
            if is_data_uri(full) {
                if let Some(text) = decode_data_uri(full) {
                    self.require.insert(full.to_string(), text);
                }
                continue;
            }
            self.dependents.entry(Area::Require.key(full)).or_default().push(id);
            if !self.keys.req_keys.iter().any(|u| u == full) {
                self.keys.req_keys.push(full.to_string());
            }
        }

        for url in script.meta.resources.values() {
            let full = script.resolve_url(url);
            if is_data_uri(full) {
                self.cache.insert(full.to_string(), full.to_string());
                continue;
            }
            self.dependents.entry(Area::Cache.key(full)).or_default().push(id);
            let listed = self.keys.cache_keys.iter().any(|u| u == full)
                || shared_cache.map_or(false, |keys| keys.iter().any(|u| u == full));
            if !listed {
                self.keys.cache_keys.push(full.to_string());
            }
        }

        self.scripts.push(script);
    }

    /// Read all data in one batch and drop scripts that cannot run.
    ///
    /// Returns the dropped scripts by id with their display names. A script
    /// cannot run when its code or any of its dependencies is missing.
    pub async fn load(&mut self, storage: &dyn Storage) -> Result<BTreeMap<u64, String>, StorageError> {
        if self.keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut data = storage.get_many(&self.keys.storage_keys()).await?;
        let mut bad = BTreeSet::new();

        for id in &self.keys.ids {
            match data.remove(&Area::Code.key(id)) {
                Some(Value::String(code)) => {
                    self.code.insert(*id, code);
                }
                _ => {
                    bad.insert(*id);
                }
            }
        }

        for (area, urls) in [
            (Area::Require, &self.keys.req_keys),
            (Area::Cache, &self.keys.cache_keys),
        ] {
            for url in urls {
                let key = area.key(url);
                match data.remove(&key) {
                    Some(Value::String(text)) => match area {
                        Area::Require => {
                            self.require.insert(url.clone(), text);
                        }
                        _ => {
                            self.cache.insert(url.clone(), text);
                        }
                    },
                    _ => {
                        log::warn!("missing {key}");
                        bad.extend(self.dependents.get(&key).into_iter().flatten().copied());
                    }
                }
            }
        }

        for id in &self.keys.value_ids {
            let value = data
                .remove(&Area::Value.key(id))
                .unwrap_or_else(|| Value::Object(Default::default()));
            self.values.insert(*id, value);
        }

        let mut dropped = BTreeMap::new();
        self.scripts.retain(|script| {
            let keep = !bad.contains(&script.id());
            if !keep {
                dropped.insert(script.id(), script.name());
            }
            keep
        });
        Ok(dropped)
    }

    /// Forget all scripts, e.g. after a failed read.
    pub fn clear_scripts(&mut self) {
        self.scripts.clear();
    }
}

/// Scripts matched for one frame, split by timing phase.
#[derive(Debug, Default)]
pub struct EnvSplit {
    /// Every matched script, with its enabled state
    pub all_ids: BTreeMap<u64, bool>,
    pub start: ScriptEnv,
    pub delayed: ScriptEnv,
}

/// Split matched scripts into early and delayed environments.
///
/// Disabled scripts only appear in `all_ids`.
pub fn split_env(scripts: impl IntoIterator<Item = ScriptRecord>) -> EnvSplit {
    let mut split = EnvSplit::default();
    for script in scripts {
        split.all_ids.insert(script.id(), script.config.enabled);
        if !script.config.enabled {
            continue;
        }
        if script.run_at().is_early() {
            split.start.add(script, None);
        } else {
            split.delayed.add(script, Some(&split.start.keys.cache_keys));
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;
    use sw_core::Meta;
    use sw_store::MemoryStorage;

    use super::*;

    fn script(id: u64, run_at: &str) -> ScriptRecord {
        let mut script = ScriptRecord::new(Meta {
            name: Some(format!("s{id}")),
            run_at: Some(run_at.to_string()),
            ..Meta::default()
        });
        script.props.id = id;
        script
    }

    #[test]
    fn test_split_by_run_at() {
        let mut disabled = script(3, "document-start");
        disabled.config.enabled = false;
        let split = split_env(vec![
            script(1, "document-start"),
            script(2, "document-idle"),
            disabled,
            script(4, "document-body"),
        ]);
        assert_eq!(split.start.keys.ids, vec![1, 4]);
        assert_eq!(split.delayed.keys.ids, vec![2]);
        assert_eq!(split.all_ids.get(&3), Some(&false));
        assert_eq!(split.all_ids.len(), 4);
    }

    #[test]
    fn test_dependencies_resolve_through_path_map() {
        let mut s = script(1, "document-start");
        s.meta.require = vec!["lib.js".into(), "data:,var%20x%3D1".into()];
        s.meta.resources.insert("css".into(), "https://cdn.test/a.css".into());
        s.meta.grant = vec!["GM_getValue".into()];
        s.custom
            .path_map
            .insert("lib.js".into(), "https://cdn.test/lib.js".into());

        let split = split_env(vec![s]);
        let keys = &split.start.keys;
        assert_eq!(keys.req_keys, vec!["https://cdn.test/lib.js".to_string()]);
        assert_eq!(keys.cache_keys, vec!["https://cdn.test/a.css".to_string()]);
        assert_eq!(keys.value_ids, vec![1]);
        assert_eq!(
            split.start.require.get("data:,var%20x%3D1").map(String::as_str),
            Some("var x=1")
        );
        assert!(keys.depends_on(Area::Require, "https://cdn.test/lib.js"));
        assert!(keys.depends_on(Area::Value, "1"));
        assert!(!keys.depends_on(Area::Cache, "https://cdn.test/lib.js"));
    }

    #[test]
    fn test_delayed_reuses_early_resources() {
        let mut early = script(1, "document-start");
        early.meta.resources.insert("a".into(), "https://cdn.test/a.css".into());
        let mut late = script(2, "document-end");
        late.meta.resources.insert("a".into(), "https://cdn.test/a.css".into());
        let split = split_env(vec![early, late]);
        assert_eq!(split.start.keys.cache_keys.len(), 1);
        assert!(split.delayed.keys.cache_keys.is_empty());
    }

    #[tokio::test]
    async fn test_load_marks_missing_dependencies() {
        let mut a = script(1, "document-start");
        a.meta.require = vec!["https://cdn.test/lib.js".into()];
        let mut b = script(2, "document-start");
        b.meta.require = vec!["https://cdn.test/lib.js".into()];
        let c = script(3, "document-start");
        let d = script(4, "document-start");

        let storage = MemoryStorage::new();
        storage
            .set_many(HashMap::from([
                ("code:1".to_string(), json!("a()")),
                ("code:2".to_string(), json!("b()")),
                ("code:3".to_string(), json!("c()")),
            ]))
            .await
            .unwrap();

        let mut env = split_env(vec![a, b, c, d]).start;
        let bad = env.load(&storage).await.unwrap();
        assert_eq!(bad.keys().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(bad.get(&4).map(String::as_str), Some("s4"));
        assert_eq!(env.scripts.len(), 1);
        assert_eq!(env.code.get(&3).map(String::as_str), Some("c()"));
    }

    #[tokio::test]
    async fn test_values_default_to_empty_object() {
        let mut s = script(7, "document-start");
        s.meta.grant = vec!["GM.getValue".into()];
        let storage = MemoryStorage::new();
        storage.set_one("code:7".into(), json!("x")).await.unwrap();
        let mut env = split_env(vec![s]).start;
        assert!(env.load(&storage).await.unwrap().is_empty());
        assert_eq!(env.values.get(&7), Some(&json!({})));
    }
}
