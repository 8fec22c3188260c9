use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_inference_sdk::{
    AppConfig, AppState, ModelLoader, ModelRegistry, build_router,
    fetch::HttpFetcher,
    session::ExecutorFactory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(
        addr = ?config.listen_addr,
        catalog = %config.catalog_path.display(),
        "loading model catalog"
    );

    let registry = Arc::new(ModelRegistry::load(&config.catalog_path)?);
    let fetcher = Arc::new(HttpFetcher::new(config.session.asset_root.clone())?);
    let loader = Arc::new(ModelLoader::with_disk_cache(
        config.session.clone(),
        fetcher,
        executor_factory()?,
    )?);

    let state = AppState::new(config.clone(), registry, loader);
    for id in &config.preload_models {
        let loaded = state.load(id).await?;
        tracing::info!(model = %id, elapsed_s = loaded.elapsed, "model preloaded");
    }
    let router = build_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(feature = "ort-backend")]
fn executor_factory() -> anyhow::Result<Arc<dyn ExecutorFactory>> {
    Ok(Arc::new(edge_inference_sdk::session::ort_backend::OrtExecutorFactory))
}

#[cfg(not(feature = "ort-backend"))]
fn executor_factory() -> anyhow::Result<Arc<dyn ExecutorFactory>> {
    anyhow::bail!("no tensor executor backend compiled in; rebuild with --features ort-backend")
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
