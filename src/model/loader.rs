use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;

use crate::{
    cache::{ArtifactCache, CacheStore, DiskStore},
    config::SessionParameters,
    error::{Result, SdkError},
    fetch::{Fetcher, fetch_artifact},
    model::{ClassLabels, ModelMetadata},
    preprocess::PreprocessorConfig,
    session::{ExecutorFactory, SessionController, SessionEnv, SessionHandle},
    tokenizer::{TextTokenizer, tokenizer_from_bytes},
};

pub type TokenizerParser = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn TextTokenizer>> + Send + Sync>;

/// Acquires everything a task model needs during `init`: sessions through
/// the controller, and configs/tokenizers straight from the fetcher.
pub struct ModelLoader {
    controller: SessionController,
    tokenizer_parser: TokenizerParser,
}

impl ModelLoader {
    pub fn new(controller: SessionController) -> Self {
        Self {
            controller,
            tokenizer_parser: Arc::new(tokenizer_from_bytes),
        }
    }

    pub fn with_tokenizer_parser(mut self, parser: TokenizerParser) -> Self {
        self.tokenizer_parser = parser;
        self
    }

    /// Wires a loader with worker-proxy support and the given cache store.
    pub fn with_store(
        params: SessionParameters,
        store: impl CacheStore + 'static,
        fetcher: Arc<dyn Fetcher>,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Self {
        let cache = ArtifactCache::new(store, params.cache_budget_bytes, params.eviction);
        let env = SessionEnv {
            params: Arc::new(params),
            cache: Arc::new(cache),
            fetcher,
            executors,
        };
        Self::new(SessionController::new(env))
    }

    /// Same as [`ModelLoader::with_store`] with the on-disk store named by the parameters.
    pub fn with_disk_cache(
        params: SessionParameters,
        fetcher: Arc<dyn Fetcher>,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Result<Self> {
        let store = DiskStore::open(&params.cache_dir, &params.cache_name)?;
        Ok(Self::with_store(params, store, fetcher, executors))
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn params(&self) -> &SessionParameters {
        &self.controller.env().params
    }

    fn fetcher(&self) -> &dyn Fetcher {
        self.controller.env().fetcher.as_ref()
    }

    pub fn check_memory(&self, metadata: &ModelMetadata) -> Result<()> {
        let limit = self.params().memory_limit_mb;
        if metadata.memory_mb > limit {
            return Err(SdkError::Config(format!(
                "model {} needs {} MB, over the {limit} MB limit",
                metadata.id, metadata.memory_mb
            )));
        }
        Ok(())
    }

    pub async fn session(
        &self,
        metadata: &ModelMetadata,
        artifact: &str,
        proxy: bool,
    ) -> Result<Arc<dyn SessionHandle>> {
        let path = metadata.artifact(artifact)?;
        let session = self.controller.create_session(path, proxy)?;
        let elapsed = session.init().await?;
        info!(model = %metadata.id, artifact, elapsed_s = elapsed, "artifact loaded");
        Ok(session)
    }

    pub async fn json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let bytes = fetch_artifact(self.fetcher(), path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn preprocessor(&self, metadata: &ModelMetadata) -> Result<PreprocessorConfig> {
        let path = metadata.preprocessor_path.as_deref().ok_or_else(|| {
            SdkError::Config(format!("model {} has no preprocessor config", metadata.id))
        })?;
        self.json(path).await
    }

    pub async fn labels(&self, metadata: &ModelMetadata) -> Result<ClassLabels> {
        let path = metadata.config_path.as_deref().ok_or_else(|| {
            SdkError::Config(format!("model {} has no class config", metadata.id))
        })?;
        let bytes = fetch_artifact(self.fetcher(), path).await?;
        ClassLabels::from_config_json(&bytes)
    }

    pub async fn tokenizer(&self, metadata: &ModelMetadata) -> Result<Arc<dyn TextTokenizer>> {
        let path = metadata.tokenizer_path.as_deref().ok_or_else(|| {
            SdkError::Config(format!("model {} has no tokenizer", metadata.id))
        })?;
        let bytes = fetch_artifact(self.fetcher(), path).await?;
        (self.tokenizer_parser)(&bytes)
    }
}
