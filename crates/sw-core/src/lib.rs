//! Scriptward Core Library
//!
//! This crate decides which userscripts apply to a URL. It holds the script
//! data model shared by the store and the injection assembler, and the two
//! rule dialects used by userscripts and by the global blacklist.
//!
//! # Architecture
//!
//! Matching is a pure function of the URL and a script's rule lists. Rule
//! strings are compiled once into [`matcher::RuleMatcher`]s and memoized in a
//! process-wide bounded cache. Blacklist decisions are memoized per URL in a
//! [`blacklist::BlacklistCache`] bounded by the total length of its keys.
//!
//! # Modules
//!
//! - `types`: Script records and their meta/custom/config/props groups
//! - `matcher`: `@match` and `@include`/`@exclude` rule compilation and testing
//! - `blacklist`: Global deny/allow list with a bounded decision cache
//! - `psl`: Public Suffix List state used by `.tld` expansion
//! - `url`: URL splitting, data URIs and relative URL resolution
//! - `meta`: `// ==UserScript==` metadata block parser
//! - `cache`: Small LRU cache used by the matcher and PSL lookups

pub mod blacklist;
pub mod cache;
pub mod matcher;
pub mod meta;
pub mod psl;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use blacklist::{Blacklist, BlacklistCache};
pub use matcher::{matches_rule, test_script, RuleMatcher};
pub use meta::{parse_meta, MetaError};
pub use psl::{get_public_suffix, init_psl, init_psl_from_text, is_psl_initialized};
pub use types::{Config, Custom, InjectInto, Meta, Props, Realm, RunAt, ScriptRecord};
