mod metrics_exporter;

pub use metrics_exporter::MetricsExporter;
