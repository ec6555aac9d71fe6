//! Network fetcher backed by reqwest

use async_trait::async_trait;
use reqwest::header::{HeaderName, CONTENT_TYPE, ETAG, LAST_MODIFIED};

use sw_store::{FetchError, Fetched, Fetcher};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("scriptward/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

fn network_error(url: &str, error: reqwest::Error) -> FetchError {
    FetchError::Network {
        url: url.to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
        log::debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let last_modified = header(LAST_MODIFIED).or_else(|| header(ETAG));
        let body = response.bytes().await.map_err(|e| network_error(url, e))?;
        Ok(Fetched {
            body: body.to_vec(),
            content_type,
            last_modified,
        })
    }
}
