//! Injection environment assembler
//!
//! Builds the bag a frame receives: matched scripts, their code wrapped and
//! ready, the resources they use and the delayed environment handle.
//!
//! Two triggers race for the same bag: the network hook, which fires before
//! the frame's content script connects ([`Assembler::prepare`]), and the
//! content script's own request ([`Assembler::get_injected`]). Whichever
//! comes first seeds the cache; the other awaits the same shared future.
//!
//! Futures returned here must be polled inside a tokio runtime, since the
//! delayed environment is resolved on a spawned task. Cached entries are
//! evicted by timers spawned on the same runtime.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;

use sw_core::matcher::rule_errors;
use sw_core::InjectInto;
use sw_store::{ScriptStore, Storage};

use crate::bag::{triage_scripts, Injection, InjectionBag, InjectionPayload};
use crate::cache::{bag_key, BagCache, ReleaseFlag, SharedBag, SharedEnv};
use crate::config::AssemblerConfig;
use crate::env::{split_env, EnvKeys, EnvSplit, ScriptEnv};
use crate::error::InjectError;
use crate::prepare::{prepare_scripts, unique_key};
use crate::report::{BadScriptReporter, Notifier};

fn lock(cache: &Mutex<BagCache>) -> MutexGuard<'_, BagCache> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

/// Prune the cache once `delay` has passed, if it still exists.
fn schedule_prune(cache: Weak<Mutex<BagCache>>, delay: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(cache) = cache.upgrade() {
            let pruned = lock(&cache).prune();
            if pruned > 0 {
                log::debug!("evicted {pruned} expired bag cache entries");
            }
        }
    });
}

pub struct Assembler {
    config: AssemblerConfig,
    cache: Arc<Mutex<BagCache>>,
    reporter: Arc<BadScriptReporter>,
}

impl Assembler {
    pub fn new(config: AssemblerConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            cache: Arc::new(Mutex::new(BagCache::new(config.cache_lifetime))),
            config,
            reporter: Arc::new(BadScriptReporter::new(notifier)),
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Apply new options; toggling injection or changing the default realm
    /// drops every cached bag.
    pub fn set_config(&mut self, config: AssemblerConfig) {
        let mut cache = lock(&self.cache);
        if self.config.invalidates(&config) {
            log::debug!("assembler options changed, clearing {} cached entries", cache.len());
            cache.clear();
        }
        cache.set_lifetime(config.cache_lifetime);
        drop(cache);
        self.config = config;
    }

    // =========================================================================
    // Bags
    // =========================================================================

    /// Cached bag for a frame, assembling it when absent.
    ///
    /// A freshly assembled bag starts resolving in the background right away
    /// when a runtime is available, and is evicted once its lifetime passes.
    pub fn prepare(&self, store: &ScriptStore, url: &str, is_top: bool) -> SharedBag {
        let key = bag_key(url, is_top);
        let mut cache = lock(&self.cache);
        if let Some(bag) = cache.get_bag(&key) {
            log::debug!("bag cache hit: {key}");
            return bag;
        }
        log::debug!("bag cache miss: {key}");
        let released = ReleaseFlag::default();
        let (bag, keys) = self.assemble(store, url, is_top, key.clone(), released.clone());
        cache.put_bag(key, bag.clone(), keys, released);
        let lifetime = cache.lifetime();
        drop(cache);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(bag.clone().map(drop));
        }
        schedule_prune(Arc::downgrade(&self.cache), lifetime);
        bag
    }

    pub async fn get_environment(&self, store: &ScriptStore, url: &str, is_top: bool) -> Arc<InjectionBag> {
        self.prepare(store, url, is_top).await
    }

    /// Bag for a frame with realms resolved.
    pub async fn get_injected(
        &self,
        store: &ScriptStore,
        url: &str,
        is_top: bool,
        page_available: bool,
    ) -> Injection {
        self.get_environment(store, url, is_top)
            .await
            .triage(page_available)
    }

    /// Delayed scripts of a bag, by its `more` key.
    pub async fn get_more(&self, more_key: &str, page_available: bool) -> Result<Injection, InjectError> {
        let env = lock(&self.cache)
            .get_more(more_key)
            .ok_or(InjectError::Expired)?;
        let env = env.await.ok_or(InjectError::Expired)?;

        let default_inject_into = self.config.default_inject_into;
        let scripts = prepare_scripts(&env, default_inject_into);
        let mut injection = triage_scripts(&scripts, page_available);
        injection.payload.cache = env.cache.clone();
        injection.payload.inject_into = default_inject_into;
        Ok(injection)
    }

    fn assemble(
        &self,
        store: &ScriptStore,
        url: &str,
        is_top: bool,
        key: String,
        released: ReleaseFlag,
    ) -> (SharedBag, Arc<EnvKeys>) {
        let expose = self.config.should_expose(url, is_top);
        if !self.config.enabled {
            let bag = Arc::new(InjectionBag::noop(expose));
            return (futures::future::ready(bag).boxed().shared(), Arc::default());
        }

        let matched = store.get_by_url(url, is_top);
        let errors: Vec<String> = matched
            .iter()
            .flat_map(|script| {
                rule_errors(script)
                    .into_iter()
                    .map(move |error| format!("{error} #{}", script.id()))
            })
            .collect();
        let split = split_env(matched.into_iter().cloned());
        let keys = Arc::new(split.start.keys.clone());

        let build = BagBuild {
            storage: store.storage().clone(),
            reporter: self.reporter.clone(),
            cache: Arc::downgrade(&self.cache),
            default_inject_into: self.config.default_inject_into,
            bag_key: key,
            released,
            expose,
            errors,
        };
        (build.run(split, keys.clone()).boxed().shared(), keys)
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop cached data affected by changed storage keys.
    pub fn on_storage_changed(&self, keys: &[String]) -> usize {
        let mut cache = lock(&self.cache);
        let dropped: usize = keys.iter().map(|key| cache.invalidate(key)).sum();
        if dropped > 0 {
            log::debug!("{} storage changes dropped {dropped} cached entries", keys.len());
        }
        dropped
    }

    /// Release a frame's bag and abort its pending delayed work.
    ///
    /// A bag still being assembled comes out cancelled, without `more`.
    pub fn release_frame(&self, url: &str, is_top: bool) -> bool {
        lock(&self.cache).release(&bag_key(url, is_top))
    }

    /// Evict expired bags.
    pub fn prune(&self) -> usize {
        lock(&self.cache).prune()
    }

    pub fn clear(&self) {
        lock(&self.cache).clear();
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Scripts reported with missing resources since the last call.
    pub fn take_pending_repairs(&self) -> Vec<u64> {
        self.reporter.take_pending()
    }
}

/// Everything the asynchronous part of assembly needs.
struct BagBuild {
    storage: Arc<dyn Storage>,
    reporter: Arc<BadScriptReporter>,
    cache: Weak<Mutex<BagCache>>,
    default_inject_into: InjectInto,
    bag_key: String,
    released: ReleaseFlag,
    expose: bool,
    errors: Vec<String>,
}

impl BagBuild {
    async fn run(mut self, split: EnvSplit, keys: Arc<EnvKeys>) -> Arc<InjectionBag> {
        let EnvSplit {
            all_ids,
            mut start,
            delayed,
        } = split;

        if let Some(error) = load_env(&*self.storage, &mut start, &self.reporter).await {
            self.errors.push(error);
        }
        let delayed_realms: Vec<InjectInto> = delayed
            .scripts
            .iter()
            .map(|script| script.inject_into(self.default_inject_into))
            .collect();
        let (more, cancelled) = if delayed.keys.is_empty() {
            (None, false)
        } else {
            match self.spawn_delayed(delayed) {
                Some(key) => (Some(key), false),
                None => (None, true),
            }
        };

        let payload = InjectionPayload {
            scripts: prepare_scripts(&start, self.default_inject_into),
            cache: std::mem::take(&mut start.cache),
            inject_into: self.default_inject_into,
            more,
            ids: all_ids,
            errors: self.errors.join("\n"),
            expose: self.expose,
            page: false,
            cancelled,
        };
        log::debug!(
            "assembled {}: {} early, {} delayed",
            self.bag_key,
            payload.scripts.len(),
            delayed_realms.len()
        );
        Arc::new(InjectionBag {
            payload,
            keys,
            delayed_realms,
        })
    }

    /// Resolve the delayed environment after a pause and cache it under a
    /// fresh key linked to this bag.
    ///
    /// Returns `None` when the frame was released or the assembler is gone.
    fn spawn_delayed(&self, mut env: ScriptEnv) -> Option<String> {
        if self.released.load(Ordering::Acquire) {
            log::debug!("{} released during assembly, skipping delayed scripts", self.bag_key);
            return None;
        }
        let cache = self.cache.upgrade()?;
        let storage = self.storage.clone();
        let reporter = self.reporter.clone();
        let keys = Arc::new(env.keys.clone());
        let task = tokio::spawn(async move {
            tokio::task::yield_now().await;
            load_env(&*storage, &mut env, &reporter).await;
            env
        });
        let abort = task.abort_handle();
        let shared: SharedEnv = async move { task.await.ok().map(Arc::new) }.boxed().shared();
        let more_key = unique_key();
        let mut guard = lock(&cache);
        let linked = guard.put_more(more_key.clone(), shared, abort, keys, &self.bag_key, &self.released);
        let lifetime = guard.lifetime();
        drop(guard);
        if !linked {
            log::debug!("{} dropped during assembly, delayed scripts cached unlinked", self.bag_key);
            schedule_prune(Arc::downgrade(&cache), lifetime);
        }
        Some(more_key)
    }
}

/// Load an environment, reporting scripts that cannot run.
///
/// A failed read leaves the environment without scripts and returns the
/// error text.
async fn load_env(storage: &dyn Storage, env: &mut ScriptEnv, reporter: &BadScriptReporter) -> Option<String> {
    match env.load(storage).await {
        Ok(bad) => {
            reporter.report(&bad);
            None
        }
        Err(e) => {
            log::error!("failed to read script environment: {e}");
            env.clear_scripts();
            Some(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use sw_core::{parse_meta, Realm, ScriptRecord};
    use sw_store::{MemoryStorage, NoFetch, StoreConfig};

    use super::*;
    use crate::report::{LogNotifier, MemoryNotifier};

    async fn store_with(scripts: &[String]) -> ScriptStore {
        let storage = Arc::new(MemoryStorage::new());
        let mut store = ScriptStore::new(storage, Arc::new(NoFetch), StoreConfig::default());
        for code in scripts {
            let script = ScriptRecord::new(parse_meta(code).unwrap());
            store.save(script, code).await.unwrap();
        }
        store
    }

    fn script(name: &str, extra: &str) -> String {
        format!("// ==UserScript==\n// @name {name}\n// @match *://a.test/*\n{extra}// ==/UserScript==\n{name}();\n")
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_bag() {
        let store = store_with(&[script("one", "// @run-at document-start\n")]).await;
        let assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));

        let hook = assembler.prepare(&store, "https://a.test/", true);
        let (a, b) = tokio::join!(
            assembler.get_environment(&store, "https://a.test/", true),
            hook,
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.payload.scripts.len(), 1);
        assert_eq!(assembler.cache_len(), 1);

        let other = assembler.get_environment(&store, "https://a.test/", false).await;
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(assembler.cache_len(), 2);
    }

    #[tokio::test]
    async fn test_early_and_delayed_split() {
        let store = store_with(&[
            script("early", "// @run-at document-start\n"),
            script("late", "// @inject-into page\n"),
        ])
        .await;
        let assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));

        let injection = assembler.get_injected(&store, "https://a.test/x", true, true).await;
        assert_eq!(injection.payload.scripts.len(), 1);
        assert_eq!(injection.payload.scripts[0].display_name, "early");
        assert!(injection.payload.page);
        assert_eq!(injection.payload.ids.len(), 2);

        let more_key = injection.payload.more.clone().unwrap();
        let more = assembler.get_more(&more_key, false).await.unwrap();
        assert!(more.payload.scripts.is_empty());
        assert_eq!(more.failed_ids, vec![more.feedback[0].id]);
        assert_eq!(more.feedback[0].realm, None);

        let more = assembler.get_more(&more_key, true).await.unwrap();
        assert_eq!(more.feedback[0].realm, Some(Realm::Page));
        assert!(more.payload.scripts[0].code.contains("late();"));
    }

    #[tokio::test]
    async fn test_release_frame_expires_delayed() {
        let store = store_with(&[script("late", "")]).await;
        let assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));

        let bag = assembler.get_environment(&store, "https://a.test/", true).await;
        let more_key = bag.payload.more.clone().unwrap();
        assert_eq!(assembler.cache_len(), 2);
        assert!(assembler.release_frame("https://a.test/", true));
        assert_eq!(assembler.cache_len(), 0);
        assert_eq!(
            assembler.get_more(&more_key, true).await.unwrap_err(),
            InjectError::Expired
        );
    }

    #[tokio::test]
    async fn test_invalidation_during_assembly_keeps_delayed() {
        let store = store_with(&[script("late", "")]).await;
        let id = store.all()[0].id();
        let assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));

        let hook = assembler.prepare(&store, "https://a.test/", true);
        let request = assembler.prepare(&store, "https://a.test/", true);
        assert_eq!(assembler.on_storage_changed(&[format!("code:{id}")]), 1);
        let later = assembler.prepare(&store, "https://a.test/", true);
        let (a, b, c) = tokio::join!(hook, request, later);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        for bag in [&a, &c] {
            assert!(!bag.payload.cancelled);
            let more_key = bag.payload.more.clone().unwrap();
            let more = assembler.get_more(&more_key, true).await.unwrap();
            assert_eq!(more.payload.scripts.len(), 1);
            assert!(more.payload.scripts[0].code.contains("late();"));
        }
        assert_ne!(a.payload.more, c.payload.more);
    }

    #[tokio::test]
    async fn test_release_during_assembly_cancels() {
        let store = store_with(&[script("late", "")]).await;
        let assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));

        let hook = assembler.prepare(&store, "https://a.test/", true);
        assert!(assembler.release_frame("https://a.test/", true));
        let bag = hook.await;
        assert!(bag.payload.cancelled);
        assert!(bag.payload.more.is_none());
        assert_eq!(bag.payload.ids.len(), 1);
        assert_eq!(assembler.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_evicted_after_lifetime() {
        let store = store_with(&[script("late", "")]).await;
        let config = AssemblerConfig {
            cache_lifetime: Duration::from_secs(10),
            ..AssemblerConfig::default()
        };
        let assembler = Assembler::new(config, Arc::new(LogNotifier));

        assembler.get_environment(&store, "https://a.test/", true).await;
        assembler.get_environment(&store, "https://b.test/", true).await;
        assert_eq!(assembler.cache_len(), 3);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(assembler.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_returns_noop() {
        let store = store_with(&[script("one", "")]).await;
        let config = AssemblerConfig {
            enabled: false,
            ..AssemblerConfig::default()
        };
        let assembler = Assembler::new(config, Arc::new(LogNotifier));
        let bag = assembler.get_environment(&store, "https://a.test/", true).await;
        assert!(bag.is_noop());
        assert!(bag.payload.scripts.is_empty());
    }

    #[tokio::test]
    async fn test_option_change_clears_cache() {
        let store = store_with(&[script("one", "// @run-at document-start\n")]).await;
        let mut assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));
        assembler.get_environment(&store, "https://a.test/", true).await;
        assert_eq!(assembler.cache_len(), 1);

        let mut config = assembler.config().clone();
        config.cache_lifetime = Duration::from_secs(1);
        assembler.set_config(config.clone());
        assert_eq!(assembler.cache_len(), 1);

        config.default_inject_into = InjectInto::Content;
        assembler.set_config(config);
        assert_eq!(assembler.cache_len(), 0);
        let bag = assembler.get_environment(&store, "https://a.test/", true).await;
        assert_eq!(bag.payload.scripts[0].inject_into, InjectInto::Content);
    }

    #[tokio::test]
    async fn test_missing_code_is_reported() {
        let store = store_with(&[script("broken", "// @run-at document-start\n")]).await;
        let id = store.all()[0].id();
        store.storage().remove_many(&[format!("code:{id}")]).await.unwrap();

        let notifier = Arc::new(MemoryNotifier::new());
        let assembler = Assembler::new(AssemblerConfig::default(), notifier.clone());
        let injection = assembler.get_injected(&store, "https://a.test/", true, true).await;
        assert!(injection.payload.scripts.is_empty());
        assert_eq!(injection.payload.ids.get(&id), Some(&true));
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(assembler.take_pending_repairs(), vec![id]);
    }

    #[tokio::test]
    async fn test_value_change_drops_dependent_bag() {
        let store = store_with(&[script("kv", "// @run-at document-start\n// @grant GM_getValue\n")]).await;
        let id = store.all()[0].id();
        store
            .storage()
            .set_one(format!("val:{id}"), json!({"k": "v1"}))
            .await
            .unwrap();
        let assembler = Assembler::new(AssemblerConfig::default(), Arc::new(LogNotifier));

        let bag = assembler.get_environment(&store, "https://a.test/", true).await;
        assert_eq!(bag.payload.scripts[0].val, Some(json!({"k": "v1"})));
        assert_eq!(assembler.on_storage_changed(&["val:999".to_string()]), 0);
        assert_eq!(assembler.on_storage_changed(&[format!("val:{id}")]), 1);
        assert_eq!(assembler.cache_len(), 0);
    }
}
