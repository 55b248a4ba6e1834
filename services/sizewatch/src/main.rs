// sizewatch service entry point.
use anyhow::{Context, Result};
use sizewatch::api;
use sizewatch::config::SizewatchConfig;
use sizewatch::observability::{self, Readiness};
use sizewatch::pipeline::Pipeline;
use sizewatch_common::SystemClock;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("sizewatch");

    let config = SizewatchConfig::from_env_or_yaml()?;
    let pipeline = Pipeline::start(&config, Arc::new(SystemClock))
        .await
        .context("start pipeline")?;

    let readiness = Readiness::default();
    let router = api::build_router(
        pipeline.handles().clone(),
        metrics_handle,
        readiness.clone(),
    );
    let listener = TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("bind http listener on {}", config.http_bind))?;
    tracing::info!(addr = %listener.local_addr()?, "http listener started");
    readiness.set_ready(true);

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve http");

    readiness.set_ready(false);
    pipeline.shutdown().await;
    tracing::info!("sizewatch stopped");
    served
}
