use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{LocalSession, Session, SessionEnv, SessionHandle};
use crate::{
    error::{Result, SdkError},
    tensor::NamedTensors,
};

/// Strategy deciding where a session lives once created.
pub trait SessionSpawner: Send + Sync {
    fn spawn(&self, session: Session) -> Result<Arc<dyn SessionHandle>>;
}

pub struct InProcessSpawner;

impl SessionSpawner for InProcessSpawner {
    fn spawn(&self, session: Session) -> Result<Arc<dyn SessionHandle>> {
        Ok(Arc::new(LocalSession::new(session)))
    }
}

/// Moves each session onto its own worker thread behind a request channel.
pub struct WorkerSpawner {
    next_id: AtomicUsize,
}

impl WorkerSpawner {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Default for WorkerSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSpawner for WorkerSpawner {
    fn spawn(&self, session: Session) -> Result<Arc<dyn SessionHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let artifact = session.artifact().to_string();
        let (requests, inbox) = mpsc::unbounded_channel();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SdkError::Worker(format!("cannot build worker runtime: {e}")))?;
        std::thread::Builder::new()
            .name(format!("session-worker-{id}"))
            .spawn(move || runtime.block_on(serve(session, inbox)))
            .map_err(|e| SdkError::Worker(format!("cannot spawn worker thread: {e}")))?;
        debug!(worker = id, %artifact, "session worker started");

        Ok(Arc::new(WorkerSession { artifact, requests }))
    }
}

enum WorkerRequest {
    Init(oneshot::Sender<Result<f64>>),
    Run(NamedTensors, oneshot::Sender<Result<NamedTensors>>),
    InputNames(oneshot::Sender<Result<Vec<String>>>),
    OutputNames(oneshot::Sender<Result<Vec<String>>>),
}

/// Requests are handled one at a time, in arrival order. The loop ends when
/// every handle is dropped, releasing the executor with the session.
async fn serve(session: Session, mut inbox: mpsc::UnboundedReceiver<WorkerRequest>) {
    while let Some(request) = inbox.recv().await {
        match request {
            WorkerRequest::Init(reply) => {
                let _ = reply.send(session.init().await);
            }
            WorkerRequest::Run(inputs, reply) => {
                let _ = reply.send(session.run_blocking(inputs));
            }
            WorkerRequest::InputNames(reply) => {
                let _ = reply.send(session.input_names());
            }
            WorkerRequest::OutputNames(reply) => {
                let _ = reply.send(session.output_names());
            }
        }
    }
    debug!(artifact = %session.artifact(), "session worker stopped");
}

/// Client stub for a session living on a worker thread.
pub struct WorkerSession {
    artifact: String,
    requests: mpsc::UnboundedSender<WorkerRequest>,
}

impl WorkerSession {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .map_err(|_| SdkError::Worker(format!("worker for {} has stopped", self.artifact)))?;
        response.await.map_err(|_| {
            SdkError::Worker(format!("worker for {} dropped the request", self.artifact))
        })?
    }
}

#[async_trait]
impl SessionHandle for WorkerSession {
    async fn init(&self) -> Result<f64> {
        self.call(WorkerRequest::Init).await
    }

    async fn run(&self, inputs: NamedTensors) -> Result<NamedTensors> {
        self.call(|reply| WorkerRequest::Run(inputs, reply)).await
    }

    async fn input_names(&self) -> Result<Vec<String>> {
        self.call(WorkerRequest::InputNames).await
    }

    async fn output_names(&self) -> Result<Vec<String>> {
        self.call(WorkerRequest::OutputNames).await
    }
}

/// Creates sessions, choosing between the in-process and the proxied
/// strategy per call.
pub struct SessionController {
    env: SessionEnv,
    local: Arc<dyn SessionSpawner>,
    remote: Option<Arc<dyn SessionSpawner>>,
}

impl SessionController {
    pub fn new(env: SessionEnv) -> Self {
        Self::with_spawners(env, Arc::new(InProcessSpawner), Some(Arc::new(WorkerSpawner::new())))
    }

    pub fn in_process(env: SessionEnv) -> Self {
        Self::with_spawners(env, Arc::new(InProcessSpawner), None)
    }

    pub fn with_spawners(
        env: SessionEnv,
        local: Arc<dyn SessionSpawner>,
        remote: Option<Arc<dyn SessionSpawner>>,
    ) -> Self {
        Self { env, local, remote }
    }

    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    pub fn supports_proxy(&self) -> bool {
        self.remote.is_some()
    }

    /// Builds an uninitialised session for `artifact`. With `proxy` set and
    /// a worker strategy available the session runs behind a worker stub.
    pub fn create_session(&self, artifact: &str, proxy: bool) -> Result<Arc<dyn SessionHandle>> {
        let session = Session::new(artifact, self.env.clone());
        match (&self.remote, proxy) {
            (Some(remote), true) => remote.spawn(session),
            _ => self.local.spawn(session),
        }
    }
}
