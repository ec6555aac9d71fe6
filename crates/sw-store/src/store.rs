//! Script store
//!
//! Owns the ordered list of installed scripts and mirrors every mutation to
//! [`Storage`]. Mutations are `&mut self` and must be serialized by the
//! caller. Reads, including [`ScriptStore::vacuum`], take `&self`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sw_core::matcher::rule_errors;
use sw_core::url::{get_full_url, is_data_uri, is_remote};
use sw_core::{parse_meta, test_script, Blacklist, Config, Custom, Meta, ScriptRecord};

use crate::error::{StoreError, StoreResult};
use crate::fetch::{download, now_ms, Fetcher};
use crate::storage::{deep_size, Area, Storage};
use crate::vacuum::{VacuumJob, VacuumReport};

const TIMEOUT_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// =============================================================================
// Configuration and inputs
// =============================================================================

/// Store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a script marked removed is kept before [`ScriptStore::check_remove`] purges it
    pub removed_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            removed_ttl: TIMEOUT_WEEK,
        }
    }
}

/// Highest id and position handed out so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreInfo {
    pub id: u64,
    pub position: i32,
}

/// Partial update of [`Config`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub removed: Option<bool>,
    pub should_update: Option<bool>,
    pub safe_include: Option<bool>,
}

impl ConfigPatch {
    pub fn apply(&self, config: &mut Config) {
        let fields = [
            (self.enabled, &mut config.enabled),
            (self.removed, &mut config.removed),
            (self.should_update, &mut config.should_update),
            (self.safe_include, &mut config.safe_include),
        ];
        for (patch, slot) in fields {
            if let Some(value) = patch {
                *slot = value;
            }
        }
    }
}

/// Changes accepted by [`ScriptStore::update_script_info`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptPatch {
    pub config: ConfigPatch,
    /// Replaces the whole `custom` group when present
    pub custom: Option<Custom>,
}

/// Dependency contents supplied by the installer, keyed by absolute URL.
#[derive(Debug, Clone, Default)]
pub struct ResourceCache {
    pub require: HashMap<String, String>,
    pub cache: HashMap<String, String>,
    /// Do not report dependencies that failed to download
    pub ignore_deps_errors: bool,
}

impl ResourceCache {
    fn get(&self, area: Area, url: &str) -> Option<&String> {
        match area {
            Area::Require => self.require.get(url),
            Area::Cache => self.cache.get(url),
            _ => None,
        }
    }
}

/// Where an installation comes from and how to merge it.
#[derive(Debug, Clone, Default)]
pub struct InstallSource {
    /// URL the code was downloaded from; base for relative dependencies
    pub url: Option<String>,
    /// Page that linked to the script
    pub from: Option<String>,
    /// Update this script instead of looking it up by name and namespace
    pub id: Option<u64>,
    /// Fail if a script with the same name and namespace already exists
    pub is_new: bool,
    pub config: ConfigPatch,
    pub custom: Option<Custom>,
    pub position: Option<i32>,
    pub cache: Option<ResourceCache>,
}

/// Result of [`ScriptStore::install`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub id: u64,
    pub is_new: bool,
    /// Text describing dependencies that could not be downloaded
    pub fetch_error: Option<String>,
    /// Rules that can never match
    pub rule_errors: Vec<String>,
}

/// Per-script storage usage in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScriptSizes {
    pub code: u64,
    pub record: u64,
    pub values: u64,
    pub requires: u64,
    pub resources: u64,
}

type SharedVacuum = Shared<BoxFuture<'static, VacuumReport>>;

// =============================================================================
// Script Store
// =============================================================================

pub struct ScriptStore {
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn Fetcher>,
    config: StoreConfig,
    scripts: Vec<ScriptRecord>,
    by_id: HashMap<u64, usize>,
    by_uri: HashMap<String, u64>,
    info: StoreInfo,
    blacklist: Blacklist,
    sizes: Arc<Mutex<HashMap<String, u64>>>,
    changes: Arc<Mutex<Vec<String>>>,
    vacuuming: Arc<Mutex<Option<SharedVacuum>>>,
}

impl ScriptStore {
    pub fn new(storage: Arc<dyn Storage>, fetcher: Arc<dyn Fetcher>, config: StoreConfig) -> Self {
        Self {
            storage,
            fetcher,
            config,
            scripts: Vec::new(),
            by_id: HashMap::new(),
            by_uri: HashMap::new(),
            info: StoreInfo::default(),
            blacklist: Blacklist::default(),
            sizes: Arc::default(),
            changes: Arc::default(),
            vacuuming: Arc::default(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn info(&self) -> StoreInfo {
        self.info
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Rebuild the in-memory list from storage.
    ///
    /// Records whose id or uri repeats an earlier one are dropped with a
    /// warning. Positions are normalized, then a sweep runs that removes
    /// orphaned keys and only reports missing ones.
    pub async fn load(&mut self) -> StoreResult<VacuumReport> {
        let data = self.storage.get_all().await?;
        self.scripts.clear();
        self.info = StoreInfo::default();

        let mut entries: Vec<(u64, &String, &Value)> = data
            .iter()
            .filter_map(|(key, value)| match Area::parse(key) {
                Some((Area::Script, id)) => id
                    .parse::<u64>()
                    .ok()
                    .filter(|id| *id > 0)
                    .map(|id| (id, key, value)),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let mut ids = HashSet::new();
        let mut uris = HashSet::new();
        for (id, key, value) in entries {
            let mut script: ScriptRecord = match serde_json::from_value(value.clone()) {
                Ok(script) => script,
                Err(e) => {
                    log::warn!("Skipping unreadable script record {key}: {e}");
                    continue;
                }
            };
            if !ids.insert(id) {
                log::warn!("Duplicate script id #{id} at {key}, discarded");
                continue;
            }
            script.props.id = id;
            let uri = script.name_uri();
            if !uris.insert(uri.clone()) {
                log::warn!("Namespace conflict for #{id} ({uri}), discarded");
                continue;
            }
            script.props.uri = uri;
            script.meta.dedup_grants();
            self.info.id = self.info.id.max(id);
            self.info.position = self.info.position.max(script.props.position);
            self.scripts.push(script);
        }
        log::debug!("loaded {} scripts", self.scripts.len());

        self.sort().await?;
        Ok(self.start_vacuum(Some(data)).await)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    fn reindex(&mut self) {
        self.by_id = self
            .scripts
            .iter()
            .enumerate()
            .map(|(index, script)| (script.props.id, index))
            .collect();
        self.by_uri = self
            .scripts
            .iter()
            .map(|script| (script.props.uri.clone(), script.props.id))
            .collect();
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Every record in position order, including those marked removed.
    pub fn all(&self) -> &[ScriptRecord] {
        &self.scripts
    }

    /// Records not marked removed, in position order.
    pub fn scripts(&self) -> impl Iterator<Item = &ScriptRecord> {
        self.scripts.iter().filter(|script| !script.config.removed)
    }

    pub fn get_script(&self, id: u64) -> Option<&ScriptRecord> {
        self.index_of(id).map(|index| &self.scripts[index])
    }

    pub fn get_script_by_uri(&self, uri: &str) -> Option<&ScriptRecord> {
        self.by_uri.get(uri).and_then(|id| self.get_script(*id))
    }

    /// Find a script by id, or else by the uri its metadata would produce.
    pub fn find_script(&self, id: Option<u64>, meta: &Meta) -> Option<&ScriptRecord> {
        match id {
            Some(id) if id != 0 => self.get_script(id),
            _ => self.get_script_by_uri(&ScriptRecord::new(meta.clone()).name_uri()),
        }
    }

    /// Scripts applicable to a navigation.
    ///
    /// Blacklisted URLs get nothing. Subframes skip `@noframes` scripts.
    pub fn get_by_url(&self, url: &str, is_top: bool) -> Vec<&ScriptRecord> {
        if let Some(rule) = self.blacklist.test(url) {
            log::debug!("{url} blacklisted by {rule}");
            return Vec::new();
        }
        self.scripts
            .iter()
            .filter(|script| {
                !script.config.removed
                    && (is_top || !script.noframes())
                    && test_script(url, script)
            })
            .collect()
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn set_blacklist(&mut self, text: &str) {
        self.blacklist.reset(text);
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    fn record_changes<I: IntoIterator<Item = String>>(&self, keys: I) {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(keys);
    }

    /// Storage keys written or removed since the last call.
    pub fn take_changes(&self) -> Vec<String> {
        std::mem::take(&mut *self.changes.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn persist(&self, ids: &[u64]) -> StoreResult<()> {
        let mut entries = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(script) = self.get_script(*id) {
                entries.insert(Area::Script.key(id), serde_json::to_value(script)?);
            }
        }
        if entries.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = entries.keys().cloned().collect();
        self.storage.set_many(entries).await?;
        self.record_changes(keys);
        Ok(())
    }

    /// Insert a new script or update the one with the same id.
    ///
    /// A new id is allocated when `props.id` is 0. Saving fails without any
    /// change when another script has the same name and namespace.
    pub async fn save(&mut self, mut script: ScriptRecord, code: &str) -> StoreResult<u64> {
        let existing = match script.props.id {
            0 => None,
            id => self.index_of(id),
        };
        let id = match script.props.id {
            0 => self.info.id + 1,
            id => id,
        };
        script.props.id = id;
        script.props.uri = script.name_uri();
        if self
            .scripts
            .iter()
            .any(|other| other.props.id != id && other.props.uri == script.props.uri)
        {
            return Err(StoreError::Conflict);
        }

        let mut info = self.info;
        info.id = info.id.max(id);
        match existing {
            Some(index) => {
                let old = &self.scripts[index].props;
                if script.props.position == 0 {
                    script.props.position = old.position;
                }
                if script.props.uuid.is_empty() {
                    script.props.uuid = old.uuid.clone();
                }
            }
            None if script.props.position == 0 => {
                info.position += 1;
                script.props.position = info.position;
            }
            None => info.position = info.position.max(script.props.position),
        }
        if script.props.uuid.is_empty() {
            script.props.uuid = uuid::Uuid::new_v4().to_string();
        }

        let entries = HashMap::from([
            (Area::Script.key(id), serde_json::to_value(&script)?),
            (Area::Code.key(id), Value::String(code.to_string())),
        ]);
        self.storage.set_many(entries).await?;
        self.record_changes([Area::Script.key(id), Area::Code.key(id)]);

        self.info = info;
        match existing {
            Some(index) => self.scripts[index] = script,
            None => self.scripts.push(script),
        }
        self.reindex();
        self.sort().await?;
        Ok(id)
    }

    /// Delete a script with its code and values. Returns false if unknown.
    pub async fn remove(&mut self, id: u64) -> StoreResult<bool> {
        let Some(index) = self.index_of(id) else {
            return Ok(false);
        };
        let keys = vec![Area::Script.key(id), Area::Code.key(id), Area::Value.key(id)];
        self.storage.remove_many(&keys).await?;
        self.record_changes(keys);
        self.scripts.remove(index);
        self.reindex();
        self.normalize().await?;
        Ok(true)
    }

    /// Move a script by `offset` places in the list.
    pub async fn move_script(&mut self, id: u64, offset: isize) -> StoreResult<bool> {
        let index = self.index_of(id).ok_or(StoreError::NotFound(id))?;
        let script = self.scripts.remove(index);
        let target = (index as isize).saturating_add(offset).clamp(0, self.scripts.len() as isize) as usize;
        self.scripts.insert(target, script);
        self.reindex();
        self.normalize().await
    }

    /// Renumber positions 1..N in list order, persisting changed records.
    pub async fn normalize(&mut self) -> StoreResult<bool> {
        let mut changed = Vec::new();
        for (index, script) in self.scripts.iter_mut().enumerate() {
            let position = index as i32 + 1;
            if script.props.position != position {
                script.props.position = position;
                changed.push(script.props.id);
            }
        }
        self.info.position = self.scripts.len() as i32;
        self.persist(&changed).await?;
        Ok(!changed.is_empty())
    }

    /// Order by stored position, then normalize.
    pub async fn sort(&mut self) -> StoreResult<bool> {
        self.scripts.sort_by_key(|script| script.props.position);
        self.reindex();
        self.normalize().await
    }

    /// Apply a patch to an existing script.
    pub async fn update_script_info(&mut self, id: u64, patch: ScriptPatch) -> StoreResult<()> {
        let index = self.index_of(id).ok_or(StoreError::NotFound(id))?;
        let script = &mut self.scripts[index];
        patch.config.apply(&mut script.config);
        if let Some(custom) = patch.custom {
            script.custom = custom;
        }
        script.props.last_modified = now_ms();
        self.persist(&[id]).await
    }

    /// Flag a script as removed (or restore it); purged later by `check_remove`.
    pub async fn mark_removed(&mut self, id: u64, removed: bool) -> StoreResult<()> {
        let patch = ScriptPatch {
            config: ConfigPatch {
                removed: Some(removed),
                ..ConfigPatch::default()
            },
            custom: None,
        };
        self.update_script_info(id, patch).await
    }

    /// Purge scripts marked removed longer than the configured ttl ago, or
    /// all of them when `force` is set. Returns the number purged.
    pub async fn check_remove(&mut self, force: bool) -> StoreResult<usize> {
        let now = now_ms();
        let ttl = self.config.removed_ttl.as_millis() as u64;
        let (purge, keep): (Vec<ScriptRecord>, Vec<ScriptRecord>) =
            std::mem::take(&mut self.scripts).into_iter().partition(|script| {
                script.config.removed
                    && (force || now.saturating_sub(script.props.last_modified) > ttl)
            });
        self.scripts = keep;
        self.reindex();
        if purge.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = purge
            .iter()
            .flat_map(|script| {
                let id = script.props.id;
                [Area::Code.key(id), Area::Script.key(id), Area::Value.key(id)]
            })
            .collect();
        self.storage.remove_many(&keys).await?;
        self.record_changes(keys);
        self.normalize().await?;
        log::debug!("purged {} removed scripts", purge.len());
        Ok(purge.len())
    }

    // =========================================================================
    // Installation
    // =========================================================================

    /// Parse, save and fetch the dependencies of a userscript.
    pub async fn install(&mut self, code: &str, src: InstallSource) -> StoreResult<InstallOutcome> {
        let meta = parse_meta(code)?;
        let existing = self.find_script(src.id, &meta).cloned();
        let (mut script, is_new) = match existing {
            Some(_) if src.is_new => return Err(StoreError::Conflict),
            Some(old) => (old, false),
            None => (ScriptRecord::new(Meta::default()), true),
        };

        src.config.apply(&mut script.config);
        script.config.removed = false;
        if let Some(custom) = src.custom {
            script.custom = custom;
        }
        let now = now_ms();
        script.props.last_modified = now;
        script.props.last_updated = now;
        script.meta = meta;
        if script.home_url().is_none() {
            if let Some(from) = src.from.as_deref().filter(|from| is_remote(from)) {
                script.custom.homepage_url = Some(from.to_string());
            }
        }
        if let Some(url) = src.url.as_deref().filter(|url| is_remote(url)) {
            script.custom.last_install_url = Some(url.to_string());
        }
        if let Some(position) = src.position {
            script.props.position = position;
        }
        script.custom.path_map = build_path_map(&script, src.url.as_deref());
        let rule_errors = rule_errors(&script);

        let id = self.save(script, code).await?;
        log::info!("{} #{id}", if is_new { "installed" } else { "updated" });
        let fetch_error = self.fetch_resources(id, src.cache.as_ref()).await;
        Ok(InstallOutcome {
            id,
            is_new,
            fetch_error,
            rule_errors,
        })
    }

    /// Download every dependency of a script in parallel.
    ///
    /// Contents supplied in `cache` are stored without downloading. Returns
    /// the collected error text, if any dependency failed.
    pub async fn fetch_resources(&self, id: u64, cache: Option<&ResourceCache>) -> Option<String> {
        let script = self.get_script(id)?;
        let meta = &script.meta;
        let mut targets: Vec<(Area, &str)> = Vec::new();
        let icon = meta.icon.as_deref().filter(|icon| is_remote(icon));
        let deps = meta
            .require
            .iter()
            .map(|url| (Area::Require, url.as_str()))
            .chain(meta.resources.values().map(|url| (Area::Cache, url.as_str())))
            .chain(icon.map(|url| (Area::Cache, url)));
        for (area, url) in deps {
            if url.is_empty() || is_data_uri(url) {
                continue;
            }
            let target = (area, script.resolve_url(url));
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        let storage = &*self.storage;
        let fetcher = &*self.fetcher;
        let results = join_all(targets.into_iter().map(|(area, url)| async move {
            match cache.and_then(|cache| cache.get(area, url)) {
                Some(contents) => {
                    let key = area.key(url);
                    storage
                        .set_one(key.clone(), Value::String(contents.clone()))
                        .await
                        .map(|()| vec![key])
                        .map_err(Into::into)
                }
                None => download(storage, fetcher, area, url, url).await,
            }
        }))
        .await;

        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(keys) => self.record_changes(keys),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if errors.is_empty() || cache.map_or(false, |cache| cache.ignore_deps_errors) {
            return None;
        }
        log::warn!("{}: failed to fetch {} dependencies", script.name(), errors.len());
        Some(format!("Error fetching resources:\n{}", errors.join("\n")))
    }

    // =========================================================================
    // Vacuum
    // =========================================================================

    /// Remove orphaned keys and re-download missing dependencies.
    ///
    /// Overlapping calls share one sweep and receive the same report.
    pub async fn vacuum(&self) -> VacuumReport {
        self.start_vacuum(None).await
    }

    fn start_vacuum(&self, snapshot: Option<HashMap<String, Value>>) -> SharedVacuum {
        let mut slot = self.vacuuming.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = slot.as_ref() {
            return running.clone();
        }
        let job = VacuumJob {
            storage: Arc::clone(&self.storage),
            fetcher: Arc::clone(&self.fetcher),
            scripts: self.scripts.clone(),
            snapshot,
            sizes: Arc::clone(&self.sizes),
            changes: Arc::clone(&self.changes),
        };
        let handle = Arc::clone(&self.vacuuming);
        let sweep = async move {
            let report = job.run().await;
            *handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
            report
        }
        .boxed()
        .shared();
        *slot = Some(sweep.clone());
        sweep
    }

    /// Storage usage per script, from the sizes recorded by the last sweep.
    pub fn sizes(&self) -> Vec<(u64, ScriptSizes)> {
        let sizes = self.sizes.lock().unwrap_or_else(|e| e.into_inner());
        let size_of = |key: String| sizes.get(&key).copied().unwrap_or(0);
        self.scripts
            .iter()
            .map(|script| {
                let id = script.props.id;
                let record = serde_json::to_value(script).ok();
                let entry = ScriptSizes {
                    code: size_of(Area::Code.key(id)),
                    record: deep_size(record.as_ref()),
                    values: size_of(Area::Value.key(id)),
                    requires: dep_size(&sizes, script, Area::Require, script.meta.require.iter()),
                    resources: dep_size(&sizes, script, Area::Cache, script.meta.resources.values()),
                };
                (id, entry)
            })
            .collect()
    }
}

/// Stored size of each dependency plus the length of its declared URL.
fn dep_size<'a>(
    sizes: &HashMap<String, u64>,
    script: &ScriptRecord,
    area: Area,
    urls: impl Iterator<Item = &'a String>,
) -> u64 {
    urls.map(|url| {
        let stored = sizes.get(&area.key(script.resolve_url(url))).copied().unwrap_or(0);
        stored + url.len() as u64
    })
    .sum()
}

/// Map each relative dependency URL of a script to its absolute form.
///
/// Resolves `@require`, `@resource` and `@icon` against `base`, falling back to
/// the URL the script was last installed from. Only entries that change are
/// kept.
pub fn build_path_map(script: &ScriptRecord, base: Option<&str>) -> BTreeMap<String, String> {
    let Some(base) = base
        .filter(|base| !base.is_empty())
        .or(script.custom.last_install_url.as_deref())
    else {
        return BTreeMap::new();
    };
    let meta = &script.meta;
    meta.require
        .iter()
        .chain(meta.resources.values())
        .chain(meta.icon.iter())
        .filter(|key| !key.is_empty())
        .filter_map(|key| {
            let full = get_full_url(key, base)?;
            (full != *key).then(|| (key.clone(), full))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{Fetched, MemoryFetcher};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn user_js(name: &str, extra: &str) -> String {
        format!(
            "// ==UserScript==\n// @name {name}\n// @namespace test\n{extra}// ==/UserScript==\nrun();\n"
        )
    }

    fn store_with(storage: Arc<MemoryStorage>, fetcher: Arc<MemoryFetcher>) -> ScriptStore {
        ScriptStore::new(storage, fetcher, StoreConfig::default())
    }

    fn empty_store() -> (ScriptStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (store_with(Arc::clone(&storage), Arc::new(MemoryFetcher::new())), storage)
    }

    fn record(name: &str) -> ScriptRecord {
        let mut meta = Meta::default();
        meta.name = Some(name.into());
        meta.namespace = Some("test".into());
        ScriptRecord::new(meta)
    }

    fn positions(store: &ScriptStore) -> Vec<(u64, i32)> {
        store.all().iter().map(|s| (s.props.id, s.props.position)).collect()
    }

    #[tokio::test]
    async fn test_save_allocates_ids_and_positions() {
        let (mut store, storage) = empty_store();
        let a = store.save(record("a"), "a()").await.unwrap();
        let b = store.save(record("b"), "b()").await.unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(positions(&store), vec![(1, 1), (2, 2)]);
        assert_eq!(storage.get_one("code:2").await.unwrap(), Some(json!("b()")));
        let saved = store.get_script(1).unwrap();
        assert_eq!(saved.props.uri, "test:a:");
        assert!(!saved.props.uuid.is_empty());
    }

    #[tokio::test]
    async fn test_save_conflict_leaves_state_untouched() {
        let (mut store, storage) = empty_store();
        store.save(record("a"), "a()").await.unwrap();
        let keys_before = storage.keys();
        let err = store.save(record("a"), "other()").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        assert_eq!(err.to_string(), "Script namespace conflicts! Please modify @name and @namespace.");
        assert_eq!(store.all().len(), 1);
        assert_eq!(store.info().id, 1);
        assert_eq!(storage.keys(), keys_before);
    }

    #[tokio::test]
    async fn test_save_updates_in_place() {
        let (mut store, _) = empty_store();
        let id = store.save(record("a"), "a()").await.unwrap();
        let uuid = store.get_script(id).unwrap().props.uuid.clone();
        let mut update = record("a");
        update.props.id = id;
        update.config.enabled = false;
        store.save(update, "a2()").await.unwrap();
        let saved = store.get_script(id).unwrap();
        assert_eq!(store.all().len(), 1);
        assert!(!saved.config.enabled);
        assert_eq!(saved.props.uuid, uuid);
        assert_eq!(saved.props.position, 1);
    }

    #[tokio::test]
    async fn test_positions_stay_contiguous() {
        let (mut store, _) = empty_store();
        for name in ["a", "b", "c", "d"] {
            store.save(record(name), "").await.unwrap();
        }
        store.move_script(1, 2).await.unwrap();
        assert_eq!(positions(&store), vec![(2, 1), (3, 2), (1, 3), (4, 4)]);
        store.move_script(4, -10).await.unwrap();
        assert_eq!(positions(&store), vec![(4, 1), (2, 2), (3, 3), (1, 4)]);
        store.remove(3).await.unwrap();
        assert_eq!(positions(&store), vec![(4, 1), (2, 2), (1, 3)]);
        let mut explicit = record("e");
        explicit.props.position = 1;
        let e = store.save(explicit, "").await.unwrap();
        let order: Vec<i32> = store.all().iter().map(|s| s.props.position).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert_eq!(store.get_script(e).unwrap().props.position, 2);
    }

    #[tokio::test]
    async fn test_move_extreme_offsets_clamp() {
        let (mut store, _) = empty_store();
        for name in ["a", "b", "c"] {
            store.save(record(name), "").await.unwrap();
        }
        store.move_script(2, isize::MAX).await.unwrap();
        assert_eq!(positions(&store), vec![(1, 1), (3, 2), (2, 3)]);
        store.move_script(2, isize::MIN).await.unwrap();
        assert_eq!(positions(&store), vec![(2, 1), (1, 2), (3, 3)]);
    }

    #[tokio::test]
    async fn test_move_unknown_is_not_found() {
        let (mut store, _) = empty_store();
        assert!(matches!(store.move_script(9, 1).await, Err(StoreError::NotFound(9))));
        assert!(matches!(
            store.update_script_info(9, ScriptPatch::default()).await,
            Err(StoreError::NotFound(9))
        ));
        assert!(!store.remove(9).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_deletes_keys() {
        let (mut store, storage) = empty_store();
        let id = store.save(record("a"), "a()").await.unwrap();
        storage.set_one("val:1".into(), json!({ "k": "v" })).await.unwrap();
        store.take_changes();
        assert!(store.remove(id).await.unwrap());
        assert!(storage.is_empty());
        let changes = store.take_changes();
        assert!(changes.contains(&"val:1".to_string()));
    }

    #[tokio::test]
    async fn test_load_discards_conflicts() {
        let storage = Arc::new(
            MemoryStorage::from_json(json!({
                "scr:3": { "meta": { "name": "dup", "namespace": "n" }, "props": { "position": 1 } },
                "scr:5": { "meta": { "name": "dup", "namespace": "n" }, "props": { "position": 2 } },
                "scr:7": { "meta": { "name": "other", "grant": ["GM_getValue", "GM_getValue"] },
                           "props": { "position": 9 }, "config": { "enabled": 1 } },
                "code:3": "x()",
                "code:7": "y()",
                "options": {}
            }))
            .unwrap(),
        );
        let mut store = store_with(Arc::clone(&storage), Arc::new(MemoryFetcher::new()));
        store.load().await.unwrap();
        assert_eq!(positions(&store), vec![(3, 1), (7, 2)]);
        assert_eq!(store.info(), StoreInfo { id: 7, position: 2 });
        let other = store.get_script(7).unwrap();
        assert_eq!(other.meta.grant.len(), 1);
        assert!(other.custom.orig_match);
        assert!(store.get_script_by_uri("n:dup:").is_some());
        // The discarded duplicate's record stays, but nothing references it.
        assert!(storage.contains("scr:5"));
    }

    #[tokio::test]
    async fn test_get_by_url_filters() {
        let (mut store, _) = empty_store();
        let mut a = record("a");
        a.meta.matches = vec!["*://a.com/*".into()];
        let mut frameless = record("b");
        frameless.meta.matches = vec!["*://a.com/*".into()];
        frameless.meta.noframes = true;
        let mut gone = record("c");
        gone.config.removed = true;
        store.save(a, "").await.unwrap();
        store.save(frameless, "").await.unwrap();
        store.save(gone, "").await.unwrap();

        let top: Vec<u64> = store.get_by_url("https://a.com/", true).iter().map(|s| s.id()).collect();
        assert_eq!(top, vec![1, 2]);
        let sub: Vec<u64> = store.get_by_url("https://a.com/", false).iter().map(|s| s.id()).collect();
        assert_eq!(sub, vec![1]);

        store.set_blacklist("a.com");
        assert!(store.get_by_url("https://a.com/", true).is_empty());
    }

    #[tokio::test]
    async fn test_mark_removed_and_check_remove() {
        let (mut store, storage) = empty_store();
        store.save(record("a"), "").await.unwrap();
        store.save(record("b"), "").await.unwrap();
        store.mark_removed(1, true).await.unwrap();
        assert_eq!(store.scripts().count(), 1);
        assert_eq!(store.check_remove(false).await.unwrap(), 0);
        assert_eq!(store.check_remove(true).await.unwrap(), 1);
        assert!(store.get_script(1).is_none());
        assert!(!storage.contains("code:1"));
        assert_eq!(positions(&store), vec![(2, 1)]);
    }

    #[tokio::test]
    async fn test_install_resolves_and_fetches_dependencies() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(
            MemoryFetcher::new()
                .with("https://cdn.test/lib/util.js", Fetched::text("util()"))
                .with(
                    "https://cdn.test/lib/icon.png",
                    Fetched {
                        body: vec![1, 2, 3],
                        content_type: Some("image/png".into()),
                        last_modified: None,
                    },
                ),
        );
        let mut store = store_with(Arc::clone(&storage), Arc::clone(&fetcher));
        let code = user_js(
            "deps",
            "// @require util.js\n// @require data:text/plain,inline\n// @icon icon.png\n\
             // @resource missing missing.css\n",
        );
        let outcome = store
            .install(
                &code,
                InstallSource {
                    url: Some("https://cdn.test/lib/deps.user.js".into()),
                    ..InstallSource::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_new);
        let script = store.get_script(outcome.id).unwrap();
        assert_eq!(script.resolve_url("util.js"), "https://cdn.test/lib/util.js");
        assert_eq!(
            script.custom.last_install_url.as_deref(),
            Some("https://cdn.test/lib/deps.user.js")
        );
        assert_eq!(storage.get_one("req:https://cdn.test/lib/util.js").await.unwrap(), Some(json!("util()")));
        assert_eq!(
            storage.get_one("cac:https://cdn.test/lib/icon.png").await.unwrap(),
            Some(json!("image/png,AQID"))
        );
        let error = outcome.fetch_error.unwrap();
        assert!(error.contains("HTTP404 https://cdn.test/lib/missing.css"));
        assert!(!fetcher.requests().iter().any(|url| url.starts_with("data:")));
    }

    #[tokio::test]
    async fn test_install_existing_and_is_new_conflict() {
        let (mut store, _) = empty_store();
        let code = user_js("same", "");
        let first = store.install(&code, InstallSource::default()).await.unwrap();
        let second = store.install(&code, InstallSource::default()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(!second.is_new);
        let err = store
            .install(&code, InstallSource { is_new: true, ..InstallSource::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        assert!(matches!(
            store.install("no block", InstallSource::default()).await,
            Err(StoreError::Meta(_))
        ));
    }

    #[tokio::test]
    async fn test_install_uses_inline_contents() {
        let (mut store, storage) = empty_store();
        let mut cache = ResourceCache::default();
        cache.require.insert("https://x.test/a.js".into(), "a()".into());
        let code = user_js("inline", "// @require https://x.test/a.js\n");
        let outcome = store
            .install(&code, InstallSource { cache: Some(cache), ..InstallSource::default() })
            .await
            .unwrap();
        assert_eq!(outcome.fetch_error, None);
        assert_eq!(storage.get_one("req:https://x.test/a.js").await.unwrap(), Some(json!("a()")));
    }

    #[test]
    fn test_build_path_map() {
        let mut script = record("p");
        script.meta.require = vec!["a.js".into(), "https://abs.test/b.js".into()];
        script.meta.icon = Some("../icon.png".into());
        let map = build_path_map(&script, Some("https://host.test/dir/s.user.js"));
        assert_eq!(map.len(), 2);
        assert_eq!(map["a.js"], "https://host.test/dir/a.js");
        assert_eq!(map["../icon.png"], "https://host.test/icon.png");
        assert!(build_path_map(&script, None).is_empty());
    }
}
