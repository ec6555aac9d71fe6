//! Scriptward Injection Assembler
//!
//! Assembles what a frame receives when it navigates: the scripts that
//! match its URL, their code wrapped for execution, their libraries,
//! resources and values, and the realm each one runs in.
//!
//! # Architecture
//!
//! Matched scripts are split by timing phase. Start and body scripts form the
//! early environment, read from storage before the bag resolves. End and idle
//! scripts form the delayed environment, read on a spawned task after a
//! pause and fetched by the frame later through the bag's `more` key. Bags
//! are cached per frame URL and dropped when the storage they were read from
//! changes.
//!
//! # Modules
//!
//! - `config`: Assembler options
//! - `env`: Early/delayed environments and their batched storage reads
//! - `prepare`: Code wrapping and per-script metadata
//! - `bag`: Transport payload and realm triage
//! - `cache`: Bag cache with linked delayed entries
//! - `assembler`: Bag assembly and invalidation
//! - `report`: Missing-resource notifications
//! - `manager`: Store mutations wired to cache invalidation
//! - `error`: Error types

pub mod assembler;
pub mod bag;
pub mod cache;
pub mod config;
pub mod env;
pub mod error;
pub mod manager;
pub mod prepare;
pub mod report;

pub use assembler::Assembler;
pub use bag::{ContentScript, Feedback, Injection, InjectionBag, InjectionPayload};
pub use config::AssemblerConfig;
pub use error::InjectError;
pub use manager::Manager;
pub use prepare::PreparedScript;
pub use report::{LogNotifier, MemoryNotifier, Notification, NotificationAction, Notifier};
