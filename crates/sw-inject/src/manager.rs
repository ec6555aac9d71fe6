//! Store and assembler coordination
//!
//! [`Manager`] owns the script store and the assembler. Every store mutation
//! goes through it so the storage keys it touched can invalidate cached
//! bags, and scripts reported with missing resources trigger a repair vacuum.

use sw_core::Meta;
use sw_store::{InstallOutcome, InstallSource, ScriptPatch, ScriptStore, StoreResult, VacuumReport};

use crate::assembler::Assembler;
use crate::bag::Injection;
use crate::cache::SharedBag;
use crate::config::AssemblerConfig;
use crate::error::InjectError;

pub struct Manager {
    store: ScriptStore,
    assembler: Assembler,
}

impl Manager {
    pub fn new(store: ScriptStore, assembler: Assembler) -> Self {
        Self { store, assembler }
    }

    pub fn store(&self) -> &ScriptStore {
        &self.store
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    pub fn into_store(self) -> ScriptStore {
        self.store
    }

    /// Forward store changes to the bag cache.
    fn sync(&self) -> usize {
        let changes = self.store.take_changes();
        if changes.is_empty() {
            return 0;
        }
        self.assembler.on_storage_changed(&changes)
    }

    // =========================================================================
    // Store
    // =========================================================================

    pub async fn load(&mut self) -> StoreResult<VacuumReport> {
        let report = self.store.load().await;
        self.assembler.clear();
        self.store.take_changes();
        report
    }

    pub async fn install(&mut self, code: &str, src: InstallSource) -> StoreResult<InstallOutcome> {
        let outcome = self.store.install(code, src).await;
        self.sync();
        outcome
    }

    pub async fn remove(&mut self, id: u64) -> StoreResult<bool> {
        let removed = self.store.remove(id).await;
        self.sync();
        removed
    }

    pub async fn move_script(&mut self, id: u64, offset: isize) -> StoreResult<bool> {
        let moved = self.store.move_script(id, offset).await;
        self.sync();
        moved
    }

    pub async fn update_script_info(&mut self, id: u64, patch: ScriptPatch) -> StoreResult<()> {
        let updated = self.store.update_script_info(id, patch).await;
        self.sync();
        updated
    }

    pub async fn mark_removed(&mut self, id: u64, removed: bool) -> StoreResult<()> {
        let marked = self.store.mark_removed(id, removed).await;
        self.sync();
        marked
    }

    /// Purge scripts marked removed; see [`ScriptStore::check_remove`].
    pub async fn check_remove(&mut self, force: bool) -> StoreResult<usize> {
        let purged = self.store.check_remove(force).await;
        self.sync();
        purged
    }

    pub fn find_script(&self, id: Option<u64>, meta: &Meta) -> Option<u64> {
        self.store.find_script(id, meta).map(|script| script.id())
    }

    /// Replace the blacklist. Matching changes, so every bag is dropped.
    pub fn set_blacklist(&mut self, text: &str) {
        self.store.set_blacklist(text);
        self.assembler.clear();
    }

    pub fn set_config(&mut self, config: AssemblerConfig) {
        self.assembler.set_config(config);
    }

    pub async fn vacuum(&self) -> VacuumReport {
        let report = self.store.vacuum().await;
        self.sync();
        report
    }

    /// Run a vacuum when scripts were reported with missing resources.
    pub async fn repair(&self) -> Option<VacuumReport> {
        let ids = self.assembler.take_pending_repairs();
        if ids.is_empty() {
            return None;
        }
        log::info!("refetching resources for scripts {ids:?}");
        Some(self.vacuum().await)
    }

    // =========================================================================
    // Injection
    // =========================================================================

    /// Network hook: start assembling a frame's bag before it asks.
    pub fn prepare(&self, url: &str, is_top: bool) -> SharedBag {
        self.assembler.prepare(&self.store, url, is_top)
    }

    pub async fn get_injected(&self, url: &str, is_top: bool, page_available: bool) -> Injection {
        let injection = self
            .assembler
            .get_injected(&self.store, url, is_top, page_available)
            .await;
        self.repair().await;
        injection
    }

    pub async fn get_more(&self, more_key: &str, page_available: bool) -> Result<Injection, InjectError> {
        let injection = self.assembler.get_more(more_key, page_available).await;
        self.repair().await;
        injection
    }

    pub fn release_frame(&self, url: &str, is_top: bool) -> bool {
        self.assembler.release_frame(url, is_top)
    }

    pub fn prune(&self) -> usize {
        self.assembler.prune()
    }
}
