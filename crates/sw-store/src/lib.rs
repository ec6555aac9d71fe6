//! Scriptward Script Store
//!
//! The authoritative, ordered collection of installed userscripts, mirrored
//! to a namespaced key-value [`Storage`] backend.
//!
//! # Modules
//!
//! - `storage`: Storage contract, key areas and the in-memory backend
//! - `fetch`: Download contract and writing fetched resources to storage
//! - `store`: Script records: load, save, remove, reorder, install
//! - `vacuum`: Garbage collection of keys no live script references
//! - `error`: Error types

pub mod error;
pub mod fetch;
pub mod storage;
pub mod store;
pub mod vacuum;

pub use error::{FetchError, StorageError, StoreError, StoreResult};
pub use fetch::{Fetched, Fetcher, MemoryFetcher, NoFetch};
pub use storage::{Area, MemoryStorage, Storage};
pub use store::{
    build_path_map, ConfigPatch, InstallOutcome, InstallSource, ResourceCache, ScriptPatch,
    ScriptSizes, ScriptStore, StoreConfig, StoreInfo,
};
pub use vacuum::VacuumReport;
