//! Dependency-aware garbage collection
//!
//! Every `code:`, `val:`, `req:`, `cac:` and `mod:` key starts out
//! untouched. Each script then touches the keys it needs. Keys nobody
//! touched are deleted. Keys a script needs that do not exist are missing:
//! code and dependencies are re-downloaded, values and update markers are
//! optional.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use sw_core::url::{is_data_uri, is_remote};
use sw_core::ScriptRecord;

use crate::fetch::{download, Fetcher};
use crate::storage::{deep_size, Area, Storage};

const SWEPT_AREAS: [Area; 5] = [Area::Value, Area::Cache, Area::Require, Area::Code, Area::Mod];

/// Outcome of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VacuumReport {
    /// Keys removed plus downloads attempted
    pub fixes: usize,
    /// One line per failed download or storage error
    pub errors: Vec<String>,
    /// Missing resources that were not downloaded
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Untouched,
    Touched,
    /// Needed by this script id but absent
    Missing(u64),
}

/// Snapshot of what one sweep needs, detached from the store.
pub(crate) struct VacuumJob {
    pub storage: Arc<dyn Storage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub scripts: Vec<ScriptRecord>,
    /// Storage dump taken at startup. When set, missing keys are only reported.
    pub snapshot: Option<HashMap<String, Value>>,
    pub sizes: Arc<Mutex<HashMap<String, u64>>>,
    pub changes: Arc<Mutex<Vec<String>>>,
}

struct Sweep<'a> {
    data: &'a HashMap<String, Value>,
    status: BTreeMap<String, Status>,
    sizes: HashMap<String, u64>,
}

impl Sweep<'_> {
    fn touch(&mut self, area: Area, ident: &str, script_id: u64) {
        if ident.is_empty() {
            return;
        }
        let key = area.key(ident);
        match self.status.get(&key).copied() {
            Some(Status::Untouched) => {
                if !area.is_per_script() {
                    if let Some(marker) = self.status.get_mut(&Area::Mod.key(ident)) {
                        *marker = Status::Touched;
                    }
                }
                if area != Area::Mod {
                    let extra = if area == Area::Value { 0 } else { key.len() as u64 };
                    self.sizes.insert(key.clone(), deep_size(self.data.get(&key)) + extra);
                }
                self.status.insert(key, Status::Touched);
            }
            None if !matches!(area, Area::Value | Area::Mod) => {
                self.status.insert(key, Status::Missing(script_id));
            }
            _ => {}
        }
    }

    fn touch_dep(&mut self, area: Area, script: &ScriptRecord, url: &str) {
        if url.is_empty() || is_data_uri(url) {
            return;
        }
        self.touch(area, script.resolve_url(url), script.props.id);
    }
}

impl VacuumJob {
    pub(crate) async fn run(mut self) -> VacuumReport {
        let mut report = VacuumReport::default();
        let no_fetch = self.snapshot.is_some();
        let data = match self.snapshot.take() {
            Some(data) => data,
            None => match self.storage.get_all().await {
                Ok(data) => data,
                Err(e) => {
                    report.errors.push(e.to_string());
                    return report;
                }
            },
        };

        let mut sweep = Sweep {
            data: &data,
            status: data
                .keys()
                .filter(|key| {
                    Area::parse(key).map_or(false, |(area, _)| SWEPT_AREAS.contains(&area))
                })
                .map(|key| (key.clone(), Status::Untouched))
                .collect(),
            sizes: HashMap::new(),
        };

        let mut download_urls: HashMap<u64, String> = HashMap::new();
        for script in &self.scripts {
            let id = script.props.id;
            let update_urls = script.update_urls();
            for url in &update_urls {
                sweep.touch(Area::Mod, url, id);
            }
            if let Some(first) = update_urls.into_iter().next() {
                download_urls.insert(id, first);
            }
            sweep.touch(Area::Code, &id.to_string(), id);
            sweep.touch(Area::Value, &id.to_string(), id);
            for url in &script.meta.require {
                sweep.touch_dep(Area::Require, script, url);
            }
            for url in script.meta.resources.values() {
                sweep.touch_dep(Area::Cache, script, url);
            }
            if let Some(icon) = script.meta.icon.as_deref().filter(|icon| is_remote(icon)) {
                sweep.touch_dep(Area::Cache, script, icon);
            }
        }

        let names: HashMap<u64, &ScriptRecord> =
            self.scripts.iter().map(|script| (script.props.id, script)).collect();
        let mut keys_to_remove = Vec::new();
        let mut to_fetch: Vec<(Area, String, String, u64)> = Vec::new();
        for (key, status) in &sweep.status {
            match *status {
                Status::Untouched => keys_to_remove.push(key.clone()),
                Status::Touched => {}
                Status::Missing(script_id) => {
                    let Some((area, ident)) = Area::parse(key) else {
                        continue;
                    };
                    let url = match area {
                        Area::Code => download_urls.get(&script_id).cloned(),
                        _ => Some(ident.to_string()),
                    };
                    match url {
                        Some(url) if !no_fetch => {
                            keys_to_remove.push(Area::Mod.key(&url));
                            to_fetch.push((area, ident.to_string(), url, script_id));
                        }
                        Some(url) => report.missing.push(url),
                        None => report.missing.push(
                            names
                                .get(&script_id)
                                .map_or_else(|| key.clone(), |script| script.pretty_url()),
                        ),
                    }
                }
            }
        }
        keys_to_remove.sort();
        keys_to_remove.dedup();
        *self.sizes.lock().unwrap_or_else(|e| e.into_inner()) = sweep.sizes;

        if !keys_to_remove.is_empty() {
            match self.storage.remove_many(&keys_to_remove).await {
                Ok(()) => self.record_changes(keys_to_remove.iter().cloned()),
                Err(e) => report.errors.push(e.to_string()),
            }
            let storage = &*self.storage;
            let fetcher = &*self.fetcher;
            let results = join_all(to_fetch.iter().map(|(area, ident, url, _)| {
                download(storage, fetcher, *area, ident, url)
            }))
            .await;
            for ((_, _, _, script_id), result) in to_fetch.iter().zip(results) {
                match result {
                    Ok(keys) => self.record_changes(keys),
                    Err(e) => {
                        let name = names
                            .get(script_id)
                            .map_or_else(|| format!("#{script_id}"), |script| script.name());
                        report.errors.push(format!("{name}: {e}"));
                    }
                }
            }
        }

        if !report.missing.is_empty() {
            log::warn!(
                "Missing required resources. Try vacuuming the database. {:?}",
                report.missing
            );
        }
        report.fixes = to_fetch.len() + keys_to_remove.len();
        log::info!(
            "vacuum: {} fixes, {} errors, {} missing",
            report.fixes,
            report.errors.len(),
            report.missing.len()
        );
        report
    }

    fn record_changes<I: IntoIterator<Item = String>>(&self, keys: I) {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(keys);
    }
}
