//! Cache-backed model sessions.
//!
//! A [`Session`] owns one executor built from one artifact. `init` resolves
//! the artifact bytes (cache first, then fetch), hands them to the
//! [`ExecutorFactory`] and moves the session to `Ready`. Callers normally
//! hold sessions through [`SessionHandle`], which hides whether the session
//! runs in-process or on a worker thread.

mod controller;
#[cfg(feature = "ort-backend")]
pub mod ort_backend;

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    cache::ArtifactCache,
    config::SessionParameters,
    error::{Result, SdkError},
    fetch::{Fetcher, fetch_artifact},
    tensor::NamedTensors,
};

pub use controller::{InProcessSpawner, SessionController, SessionSpawner, WorkerSpawner};

/// Only the maximum level is ever requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphOptimizationLevel {
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub execution_providers: Vec<String>,
    pub intra_op_threads: usize,
    pub graph_optimization_level: GraphOptimizationLevel,
    pub execution_mode: ExecutionMode,
}

impl ExecutorOptions {
    pub fn from_parameters(params: &SessionParameters) -> Self {
        Self {
            execution_providers: params.execution_providers.clone(),
            intra_op_threads: params.num_threads,
            graph_optimization_level: GraphOptimizationLevel::All,
            execution_mode: ExecutionMode::Parallel,
        }
    }
}

pub trait Executor: Send {
    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors>;
    fn input_names(&self) -> &[String];
    fn output_names(&self) -> &[String];
}

pub trait ExecutorFactory: Send + Sync {
    fn create(&self, model_bytes: Vec<u8>, options: &ExecutorOptions) -> Result<Box<dyn Executor>>;
}

/// The uniform session contract, identical for local and proxied sessions.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Loads the artifact and builds the executor. Returns elapsed seconds.
    async fn init(&self) -> Result<f64>;
    async fn run(&self, inputs: NamedTensors) -> Result<NamedTensors>;
    async fn input_names(&self) -> Result<Vec<String>>;
    async fn output_names(&self) -> Result<Vec<String>>;
}

/// Picks `preferred` when the model declares that output, else its first output.
pub async fn resolve_output(session: &dyn SessionHandle, preferred: &str) -> Result<String> {
    let outputs = session.output_names().await?;
    if outputs.iter().any(|o| o == preferred) {
        return Ok(preferred.to_string());
    }
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| SdkError::Config(format!("model declares no outputs, expected {preferred}")))
}

/// Picks `preferred` when the model declares that input, else its first input.
pub async fn resolve_input(session: &dyn SessionHandle, preferred: &str) -> Result<String> {
    let inputs = session.input_names().await?;
    if inputs.iter().any(|i| i == preferred) {
        return Ok(preferred.to_string());
    }
    inputs
        .into_iter()
        .next()
        .ok_or_else(|| SdkError::Config(format!("model declares no inputs, expected {preferred}")))
}

/// Collaborators every session needs, fixed at construction.
#[derive(Clone)]
pub struct SessionEnv {
    pub params: Arc<SessionParameters>,
    pub cache: Arc<ArtifactCache>,
    pub fetcher: Arc<dyn Fetcher>,
    pub executors: Arc<dyn ExecutorFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

struct Loaded {
    executor: Arc<Mutex<Box<dyn Executor>>>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

enum SessionState {
    Uninitialized,
    Initializing,
    Ready(Loaded),
    Failed(String),
}

pub struct Session {
    artifact: String,
    env: SessionEnv,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(artifact: impl Into<String>, env: SessionEnv) -> Self {
        Self {
            artifact: artifact.into(),
            env,
            state: RwLock::new(SessionState::Uninitialized),
        }
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.state.read() {
            SessionState::Uninitialized => SessionStatus::Uninitialized,
            SessionState::Initializing => SessionStatus::Initializing,
            SessionState::Ready(_) => SessionStatus::Ready,
            SessionState::Failed(_) => SessionStatus::Failed,
        }
    }

    pub async fn init(&self) -> Result<f64> {
        {
            let mut state = self.state.write();
            match &*state {
                SessionState::Uninitialized => {}
                SessionState::Ready(_) => return Ok(0.0),
                SessionState::Initializing => {
                    return Err(SdkError::Config(format!(
                        "session for {} is already initializing",
                        self.artifact
                    )));
                }
                SessionState::Failed(reason) => {
                    return Err(SdkError::SessionFailed {
                        artifact: self.artifact.clone(),
                        reason: reason.clone(),
                    });
                }
            }
            *state = SessionState::Initializing;
        }

        let start = Instant::now();
        match self.load().await {
            Ok(loaded) => {
                *self.state.write() = SessionState::Ready(loaded);
                let elapsed = start.elapsed().as_secs_f64();
                info!(artifact = %self.artifact, elapsed_s = elapsed, "session ready");
                Ok(elapsed)
            }
            Err(err) => {
                *self.state.write() = SessionState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    async fn load(&self) -> Result<Loaded> {
        let bytes = self.artifact_bytes().await?;
        let options = ExecutorOptions::from_parameters(&self.env.params);
        let factory = self.env.executors.clone();
        let executor = tokio::task::spawn_blocking(move || factory.create(bytes, &options))
            .await
            .map_err(|e| SdkError::Inference(format!("executor creation task failed: {e}")))??;

        Ok(Loaded {
            input_names: executor.input_names().to_vec(),
            output_names: executor.output_names().to_vec(),
            executor: Arc::new(Mutex::new(executor)),
        })
    }

    async fn artifact_bytes(&self) -> Result<Vec<u8>> {
        let cache = self.env.cache.clone();
        let key = self.artifact.clone();
        let cached = tokio::task::spawn_blocking(move || cache.get(&key))
            .await
            .map_err(|e| SdkError::Cache(format!("cache read task failed: {e}")))
            .and_then(|r| r);

        match cached {
            Ok(Some(bytes)) => {
                debug!(artifact = %self.artifact, bytes = bytes.len(), "artifact cache hit");
                return Ok(bytes);
            }
            Ok(None) => debug!(artifact = %self.artifact, "artifact cache miss"),
            Err(err) => warn!(artifact = %self.artifact, error = %err, "artifact cache unusable, fetching"),
        }

        let bytes = fetch_artifact(self.env.fetcher.as_ref(), &self.artifact).await?;

        let cache = self.env.cache.clone();
        let key = self.artifact.clone();
        let stored = bytes.clone();
        match tokio::task::spawn_blocking(move || cache.put(&key, &stored)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(artifact = %self.artifact, error = %err, "failed to cache artifact"),
            Err(err) => warn!(artifact = %self.artifact, error = %err, "cache write task failed"),
        }
        Ok(bytes)
    }

    fn loaded<T>(&self, f: impl FnOnce(&Loaded) -> T) -> Result<T> {
        match &*self.state.read() {
            SessionState::Ready(loaded) => Ok(f(loaded)),
            SessionState::Failed(reason) => Err(SdkError::SessionFailed {
                artifact: self.artifact.clone(),
                reason: reason.clone(),
            }),
            _ => Err(SdkError::NotInitialized(self.artifact.clone())),
        }
    }

    pub fn run_blocking(&self, inputs: NamedTensors) -> Result<NamedTensors> {
        let executor = self.loaded(|l| l.executor.clone())?;
        let mut executor = executor.lock();
        executor.run(inputs)
    }

    pub fn input_names(&self) -> Result<Vec<String>> {
        self.loaded(|l| l.input_names.clone())
    }

    pub fn output_names(&self) -> Result<Vec<String>> {
        self.loaded(|l| l.output_names.clone())
    }
}

/// A session driven from the caller's runtime; executor runs go to the
/// blocking pool so they never stall async tasks.
pub struct LocalSession {
    inner: Arc<Session>,
}

impl LocalSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(session),
        }
    }
}

#[async_trait]
impl SessionHandle for LocalSession {
    async fn init(&self) -> Result<f64> {
        self.inner.init().await
    }

    async fn run(&self, inputs: NamedTensors) -> Result<NamedTensors> {
        let session = self.inner.clone();
        tokio::task::spawn_blocking(move || session.run_blocking(inputs))
            .await
            .map_err(|e| SdkError::Inference(format!("inference task failed: {e}")))?
    }

    async fn input_names(&self) -> Result<Vec<String>> {
        self.inner.input_names()
    }

    async fn output_names(&self) -> Result<Vec<String>> {
        self.inner.output_names()
    }
}
