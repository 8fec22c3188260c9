//! Remote artifact retrieval.

use std::{collections::HashMap, io::Read, path::PathBuf, time::Duration};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, SdkError};

/// Source of artifact bytes (models, configs, tokenizers).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>>;
}

/// Fetches `path` and gunzips it when the path ends in `.gz`.
pub async fn fetch_artifact(fetcher: &dyn Fetcher, path: &str) -> Result<Vec<u8>> {
    let bytes = fetcher.fetch_raw(path).await?;
    if path.ends_with(".gz") {
        let compressed = bytes.len();
        let bytes = tokio::task::spawn_blocking(move || gunzip(&bytes))
            .await
            .map_err(|e| SdkError::Inference(format!("decompression task failed: {e}")))?
            .map_err(|e| SdkError::fetch(path, format!("gzip decode failed: {e}")))?;
        debug!(path, compressed, decompressed = bytes.len(), "decompressed artifact");
        return Ok(bytes);
    }
    Ok(bytes)
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// HTTP GET fetcher. Paths without a scheme are resolved against `base_url`.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    fn resolve(&self, path: &str) -> Result<String> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(path.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(format!("{base}/{}", path.trim_start_matches('/'))),
            None => Err(SdkError::Config(format!(
                "relative artifact path {path} needs an asset root"
            ))),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.resolve(path)?;
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SdkError::fetch(&url, format!("server responded {status}")));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path.trim_start_matches('/'));
        tokio::task::spawn_blocking(move || std::fs::read(full))
            .await
            .map_err(|e| SdkError::fetch(path, e))?
            .map_err(|e| SdkError::fetch(path, e))
    }
}

/// In-memory artifact map. Counts requests per path.
#[derive(Default)]
pub struct StaticFetcher {
    files: RwLock<HashMap<String, Vec<u8>>>,
    hits: RwLock<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), bytes.into());
    }

    pub fn requests(&self, path: &str) -> usize {
        self.hits.read().get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>> {
        *self.hits.write().entry(path.to_string()).or_default() += 1;
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| SdkError::fetch(path, "not found"))
    }
}
