#[macro_use]
extern crate tracing;

use anyhow::{Context, Result as AnyResult};
use bound_cert_store::{components::MetricsExporter, configs::ApplicationConfig, BoundCertStore};
use std::{num::NonZeroUsize, sync::Arc};
use tokio::{signal, sync::Mutex};

fn main() -> AnyResult<()> {
    // Load environment variables from the `.env` file
    dotenvy::dotenv().ok();
    // Initialize the logger after loading the environment variables
    tracing_subscriber::fmt::init();

    let app_config = ApplicationConfig::load_config().context("Failed to parse configuration files")?;

    // Setup async runtime
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(worker) = app_config.workers.and_then(NonZeroUsize::new) {
        runtime_builder.worker_threads(worker.into());
    }
    runtime_builder
        .enable_all()
        .build()
        .context("Failed to bootstrap the Tokio runtime")?
        .block_on(server_loop(app_config))
}

async fn server_loop(app_config: ApplicationConfig) -> AnyResult<()> {
    let mut store = BoundCertStore::new(app_config.persistence.open(), app_config.store.clone());
    if app_config.persistence.force_keep_session_state {
        store.set_force_keep_session_state();
    }
    store.wait_for_load().await;
    info!("Bound certificate store ready with {} records", store.get_count());

    let store = Arc::new(Mutex::new(store));
    let exporter = MetricsExporter::new(store.clone(), &app_config.exporter)?;

    tokio::select! {
        result = exporter.run() => result?,
        result = signal::ctrl_c() => {
            result.context("Failed to listen for the shutdown signal")?;
            info!("Shutting down");
        }
    }

    Ok(())
}
