use crate::{configs::ExporterConfig, store::BoundCertStore};
use anyhow::Result as AnyResult;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use chrono::Utc;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Debug)]
struct ExporterState {
    pub store: Arc<Mutex<BoundCertStore>>,
    pub registry: Registry,
    pub metric_records: IntGauge,
    pub metric_expired: IntGauge,
    pub metric_creation: IntGaugeVec,
    pub metric_expiration: IntGaugeVec,
}

#[derive(Clone, Debug)]
pub struct MetricsExporter {
    listen: SocketAddr,
    state: ExporterState,
}

impl MetricsExporter {
    pub fn new(store: Arc<Mutex<BoundCertStore>>, config: &ExporterConfig) -> AnyResult<Self> {
        let registry = Registry::new_custom(None, None)?;
        let cert_labels = ["server"];

        let metric_records = IntGauge::with_opts(
            Opts::new("records", "Number of bound certificates in the store")
                .namespace("bcs")
                .subsystem("store"),
        )?;
        registry.register(Box::new(metric_records.clone()))?;
        let metric_expired = IntGauge::with_opts(
            Opts::new("expired_records", "Number of bound certificates past expiration")
                .namespace("bcs")
                .subsystem("store"),
        )?;
        registry.register(Box::new(metric_expired.clone()))?;
        let metric_creation = IntGaugeVec::new(
            Opts::new("creation_timestamp", "Bound certificate creation timestamp")
                .namespace("bcs")
                .subsystem("cert"),
            &cert_labels,
        )?;
        registry.register(Box::new(metric_creation.clone()))?;
        let metric_expiration = IntGaugeVec::new(
            Opts::new("expiration_timestamp", "Bound certificate expiration timestamp")
                .namespace("bcs")
                .subsystem("cert"),
            &cert_labels,
        )?;
        registry.register(Box::new(metric_expiration.clone()))?;

        Ok(Self {
            listen: config.listen,
            state: ExporterState {
                store,
                registry,
                metric_records,
                metric_expired,
                metric_creation,
                metric_expiration,
            },
        })
    }

    pub async fn run(&self) -> AnyResult<()> {
        let router = Router::new()
            .route("/metrics", get(Self::handle_metrics))
            .with_state(self.state.clone());

        let listener = TcpListener::bind(self.listen).await?;
        info!("Serving metrics on http://{}/metrics", self.listen);
        axum::serve(listener, router).await?;
        Ok(())
    }

    async fn handle_metrics(state: State<ExporterState>) -> Result<String, StatusCode> {
        Self::render(&state).await
    }

    async fn render(state: &ExporterState) -> Result<String, StatusCode> {
        let mut store = state.store.lock().await;
        if !store.is_loaded() {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
        let snapshot = store.get_all();
        drop(store);

        let records = snapshot.await.map_err(|e| {
            error!("Failed to read the store: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        // Drop series of certificates deleted since the last scrape
        state.metric_creation.reset();
        state.metric_expiration.reset();
        state.metric_records.set(records.len() as i64);
        let now = Utc::now();
        let expired = records.iter().filter(|record| record.is_expired(now)).count();
        state.metric_expired.set(expired as i64);

        for record in &records {
            let label_values = [record.server_identifier.as_str()];

            match state
                .metric_creation
                .get_metric_with_label_values(&label_values)
            {
                Ok(metric) => metric.set(record.creation_time.timestamp()),
                Err(e) => {
                    error!("Failed to get metric: {}", e);
                }
            }
            match state
                .metric_expiration
                .get_metric_with_label_values(&label_values)
            {
                Ok(metric) => metric.set(record.expiration_time.timestamp()),
                Err(e) => {
                    error!("Failed to get metric: {}", e);
                }
            }
        }

        let encoder = TextEncoder::new();
        let resp = encoder
            .encode_to_string(&state.registry.gather())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        Ok(resp)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{configs::StoreConfig, persistent::MemoryPersistentStore};
    use chrono::TimeZone;

    #[tokio::test]
    async fn renders_store_contents() {
        let mut store = BoundCertStore::in_memory(StoreConfig::default());
        store.set(
            "a.com",
            Utc.timestamp_opt(1_000, 0).unwrap(),
            Utc.timestamp_opt(2_000, 0).unwrap(),
            "pk",
            "cert",
        );
        let store = Arc::new(Mutex::new(store));
        let exporter = MetricsExporter::new(store.clone(), &ExporterConfig::default()).unwrap();

        let body = MetricsExporter::render(&exporter.state).await.unwrap();
        assert!(body.contains("bcs_store_records 1"));
        assert!(body.contains("bcs_store_expired_records 1"));
        assert!(body.contains(r#"bcs_cert_creation_timestamp{server="a.com"} 1000"#));
        assert!(body.contains(r#"bcs_cert_expiration_timestamp{server="a.com"} 2000"#));

        store.lock().await.delete("a.com").await.unwrap();
        let body = MetricsExporter::render(&exporter.state).await.unwrap();
        assert!(body.contains("bcs_store_records 0"));
        assert!(body.contains("bcs_store_expired_records 0"));
        assert!(!body.contains(r#"server="a.com""#));
    }

    #[tokio::test]
    async fn unavailable_until_loaded() {
        let backing = Arc::new(MemoryPersistentStore::new());
        let store = Arc::new(Mutex::new(BoundCertStore::with_backing_store(
            backing,
            StoreConfig::default(),
        )));
        let exporter = MetricsExporter::new(store.clone(), &ExporterConfig::default()).unwrap();

        let status = MetricsExporter::render(&exporter.state).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        store.lock().await.wait_for_load().await;
        assert!(MetricsExporter::render(&exporter.state).await.is_ok());
    }
}
