//! Remote resource download contract
//!
//! The store never talks to the network itself. A [`Fetcher`] returns raw
//! bytes and [`download`] writes them into the right storage area.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde_json::Value;

use crate::error::FetchError;
use crate::storage::{Area, Storage};

/// A downloaded resource.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// `Last-Modified` (or `ETag`) of the response, kept as the `mod:` marker
    pub last_modified: Option<String>,
}

impl Fetched {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into().into_bytes(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError>;
}

/// Fetcher for offline use: every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFetch;

#[async_trait]
impl Fetcher for NoFetch {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        Err(FetchError::Network {
            url: url.to_string(),
            message: "Offline".to_string(),
        })
    }
}

/// Serves resources from a fixed URL map; unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    responses: RwLock<HashMap<String, Fetched>>,
    requests: RwLock<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, response: Fetched) -> Self {
        self.insert(url, response);
        self
    }

    pub fn insert(&self, url: &str, response: Fetched) {
        self.responses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), response);
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        self.requests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        let responses = self.responses.read().unwrap_or_else(|e| e.into_inner());
        responses.get(url).cloned().ok_or_else(|| FetchError::Http {
            status: 404,
            url: url.to_string(),
        })
    }
}

// =============================================================================
// Download into storage
// =============================================================================

/// Encode a fetched body for its storage area.
///
/// Code and libraries are stored as text; cached resources as
/// `<mime type>,<base64>` so binary payloads survive JSON storage.
pub fn encode_body(area: Area, fetched: &Fetched) -> Value {
    match area {
        Area::Cache => {
            let mime = fetched
                .content_type
                .as_deref()
                .and_then(|ct| ct.split(';').next())
                .map(str::trim)
                .filter(|ct| !ct.is_empty())
                .unwrap_or("application/octet-stream");
            Value::String(format!("{mime},{}", BASE64_STANDARD.encode(&fetched.body)))
        }
        _ => Value::String(String::from_utf8_lossy(&fetched.body).into_owned()),
    }
}

/// Download `url` and store it under `area`/`id`.
///
/// Also writes the `mod:<url>` marker. Returns the storage keys written.
pub async fn download(
    storage: &dyn Storage,
    fetcher: &dyn Fetcher,
    area: Area,
    id: &str,
    url: &str,
) -> Result<Vec<String>, FetchError> {
    let fetched = fetcher.fetch(url).await?;
    let key = area.key(id);
    let marker = Area::Mod.key(url);
    let stamp = fetched
        .last_modified
        .clone()
        .unwrap_or_else(|| now_ms().to_string());
    let entries = HashMap::from([
        (key.clone(), encode_body(area, &fetched)),
        (marker.clone(), Value::String(stamp)),
    ]);
    storage.set_many(entries).await?;
    log::debug!("downloaded {url} -> {key}");
    Ok(vec![key, marker])
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
