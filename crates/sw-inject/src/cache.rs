//! Bag cache
//!
//! Assembled bags are cached per `(url, is_top)` for a bounded lifetime. A
//! bag whose delayed environment is still resolving has a second entry,
//! keyed by the bag's `more` key, linked to it: dropping either drops both
//! and aborts the pending computation. A delayed environment whose bag was
//! invalidated mid-assembly is cached unlinked, with its own lifetime.
//!
//! Entries hold shared futures, so a request arriving while a bag is being
//! assembled awaits the same computation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use sw_store::Area;

use crate::bag::InjectionBag;
use crate::env::{EnvKeys, ScriptEnv};

pub type SharedBag = Shared<BoxFuture<'static, Arc<InjectionBag>>>;

/// Delayed environment; `None` when its computation was aborted.
pub type SharedEnv = Shared<BoxFuture<'static, Option<Arc<ScriptEnv>>>>;

/// Cache key of a frame's bag. URLs are normalized when they parse.
pub fn bag_key(url: &str, is_top: bool) -> String {
    let url = url::Url::parse(url)
        .map(String::from)
        .unwrap_or_else(|_| url.to_string());
    if is_top {
        url
    } else {
        format!("-{url}")
    }
}

/// Set once a frame's bag is released, so an assembly still in flight can
/// skip its delayed environment.
pub type ReleaseFlag = Arc<AtomicBool>;

enum Cached {
    Bag(SharedBag, ReleaseFlag),
    More(SharedEnv, AbortHandle),
}

struct CacheEntry {
    value: Cached,
    keys: Arc<EnvKeys>,
    expires: Instant,
    link: Option<String>,
}

pub struct BagCache {
    lifetime: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl BagCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            entries: HashMap::new(),
        }
    }

    pub fn set_lifetime(&mut self, lifetime: Duration) {
        self.lifetime = lifetime;
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn live(&mut self, key: &str) -> Option<&CacheEntry> {
        let expired = self.entries.get(key)?.expires <= Instant::now();
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key)
    }

    pub fn get_bag(&mut self, key: &str) -> Option<SharedBag> {
        match &self.live(key)?.value {
            Cached::Bag(bag, _) => Some(bag.clone()),
            Cached::More(..) => None,
        }
    }

    pub fn get_more(&mut self, key: &str) -> Option<SharedEnv> {
        match &self.live(key)?.value {
            Cached::More(env, _) => Some(env.clone()),
            Cached::Bag(..) => None,
        }
    }

    pub fn put_bag(&mut self, key: String, bag: SharedBag, keys: Arc<EnvKeys>, released: ReleaseFlag) {
        let entry = CacheEntry {
            value: Cached::Bag(bag, released),
            keys,
            expires: Instant::now() + self.lifetime,
            link: None,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.drop_entry(old);
        }
    }

    /// Cache a delayed environment linked to the bag at `bag_key`, which
    /// `owner` identifies.
    ///
    /// When that bag is gone, or was replaced by a newer one, the environment
    /// is cached unlinked, expiring one lifetime from now. Returns whether it
    /// was linked.
    pub fn put_more(
        &mut self,
        key: String,
        env: SharedEnv,
        abort: AbortHandle,
        keys: Arc<EnvKeys>,
        bag_key: &str,
        owner: &ReleaseFlag,
    ) -> bool {
        let bag = self.entries.get_mut(bag_key).filter(|entry| {
            matches!(&entry.value, Cached::Bag(_, released) if Arc::ptr_eq(released, owner))
        });
        let (expires, link) = match bag {
            Some(bag) => {
                bag.link = Some(key.clone());
                (bag.expires, Some(bag_key.to_string()))
            }
            None => (Instant::now() + self.lifetime, None),
        };
        let linked = link.is_some();
        let entry = CacheEntry {
            value: Cached::More(env, abort),
            keys,
            expires,
            link,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.drop_entry(old);
        }
        linked
    }

    /// Drop a frame's bag for good, flagging an assembly still in flight.
    pub fn release(&mut self, key: &str) -> bool {
        if let Some(CacheEntry {
            value: Cached::Bag(_, released),
            ..
        }) = self.entries.get(key)
        {
            released.store(true, Ordering::Release);
        }
        self.remove(key)
    }

    /// Drop an entry together with its linked entry.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.drop_entry(entry);
                true
            }
            None => false,
        }
    }

    fn drop_entry(&mut self, entry: CacheEntry) {
        if let Cached::More(_, abort) = &entry.value {
            abort.abort();
        }
        if let Some(link) = entry.link {
            if let Some(linked) = self.entries.remove(&link) {
                if let Cached::More(_, abort) = &linked.value {
                    abort.abort();
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            if let Cached::More(_, abort) = &entry.value {
                abort.abort();
            }
        }
    }

    /// Evict expired entries. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let before = self.entries.len();
        for key in expired {
            self.remove(&key);
        }
        before - self.entries.len()
    }

    /// Drop entries affected by a change of the storage key `key`.
    ///
    /// Script records and code affect matching itself, so they clear
    /// everything. Returns how many entries were dropped.
    pub fn invalidate(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        match Area::parse(key) {
            Some((Area::Script | Area::Code, _)) => self.clear(),
            Some((Area::Mod, _)) => {}
            Some((area, id)) => {
                let stale: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.keys.depends_on(area, id))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in stale {
                    self.remove(&key);
                }
            }
            None => {
                log::debug!("unknown storage key {key}, clearing bag cache");
                self.clear();
            }
        }
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn ready_bag() -> SharedBag {
        futures::future::ready(Arc::new(InjectionBag::default()))
            .boxed()
            .shared()
    }

    fn put(cache: &mut BagCache, key: &str, req: &str, value_id: u64) -> ReleaseFlag {
        let owner = ReleaseFlag::default();
        cache.put_bag(key.into(), ready_bag(), keys(req, value_id), owner.clone());
        owner
    }

    fn keys(req: &str, value_id: u64) -> Arc<EnvKeys> {
        Arc::new(EnvKeys {
            ids: vec![value_id],
            req_keys: vec![req.to_string()],
            cache_keys: Vec::new(),
            value_ids: vec![value_id],
        })
    }

    fn pending_more() -> (SharedEnv, AbortHandle) {
        let task = tokio::spawn(futures::future::pending::<ScriptEnv>());
        let abort = task.abort_handle();
        let env = async move { task.await.ok().map(Arc::new) }.boxed().shared();
        (env, abort)
    }

    #[test]
    fn test_bag_key() {
        assert_eq!(bag_key("https://a.test/", true), "https://a.test/");
        assert_eq!(bag_key("https://a.test/", false), "-https://a.test/");
        assert_eq!(bag_key("HTTPS://A.test", true), "https://a.test/");
        assert_eq!(bag_key("not a url", false), "-not a url");
    }

    #[tokio::test]
    async fn test_linked_entries_drop_together() {
        let mut cache = BagCache::new(Duration::from_secs(60));
        let owner = put(&mut cache, "u", "https://lib.test/a.js", 1);
        let (env, abort) = pending_more();
        assert!(cache.put_more("m".into(), env.clone(), abort, keys("x", 2), "u", &owner));
        assert_eq!(cache.len(), 2);

        assert!(cache.remove("u"));
        assert!(cache.is_empty());
        assert!(env.await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_more_without_bag_is_kept_unlinked() {
        let mut cache = BagCache::new(Duration::from_secs(10));
        let (env, abort) = pending_more();
        assert!(!cache.put_more("m".into(), env, abort, keys("x", 2), "gone", &ReleaseFlag::default()));
        assert!(cache.get_more("m").is_some());

        let stale = put(&mut cache, "u", "x", 1);
        put(&mut cache, "u", "x", 1);
        let (env, abort) = pending_more();
        assert!(!cache.put_more("n".into(), env, abort, keys("x", 2), "u", &stale));
        assert!(cache.remove("u"));
        assert!(cache.get_more("n").is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.prune(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_release_flags_bag() {
        let mut cache = BagCache::new(Duration::from_secs(60));
        let released = ReleaseFlag::default();
        cache.put_bag("u".into(), ready_bag(), keys("x", 1), released.clone());
        assert!(!released.load(Ordering::Acquire));

        assert_eq!(cache.invalidate("val:1"), 1);
        assert!(!released.load(Ordering::Acquire));

        cache.put_bag("u".into(), ready_bag(), keys("x", 1), released.clone());
        assert!(cache.release("u"));
        assert!(released.load(Ordering::Acquire));
        assert!(!cache.release("u"));
    }

    #[tokio::test]
    async fn test_invalidate_by_dependency() {
        let mut cache = BagCache::new(Duration::from_secs(60));
        put(&mut cache, "a", "https://lib.test/a.js", 1);
        put(&mut cache, "b", "https://lib.test/b.js", 2);

        assert_eq!(cache.invalidate("mod:https://lib.test/a.js"), 0);
        assert_eq!(cache.invalidate("req:https://lib.test/a.js"), 1);
        assert!(!cache.contains("a"));
        assert_eq!(cache.invalidate("val:3"), 0);
        assert_eq!(cache.invalidate("val:2"), 1);
        assert!(cache.is_empty());

        put(&mut cache, "a", "https://lib.test/a.js", 1);
        put(&mut cache, "b", "https://lib.test/b.js", 2);
        assert_eq!(cache.invalidate("code:9"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_prune() {
        let mut cache = BagCache::new(Duration::from_secs(10));
        put(&mut cache, "a", "x", 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        put(&mut cache, "b", "y", 2);
        assert!(cache.get_bag("a").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get_bag("a").is_none());
        assert!(cache.get_more("b").is_none());
        assert!(cache.get_bag("b").is_some());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.prune(), 1);
        assert!(cache.is_empty());
    }
}
