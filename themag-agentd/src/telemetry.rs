use crate::domain::origin::OriginDecision;
use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Bridge metrics exported over OTLP when an endpoint is configured.
pub struct BridgeMetrics {
    pub handshakes: Counter<u64>,
    pub sessions_opened: Counter<u64>,
    pub processes_spawned: Counter<u64>,
    pub spawn_failures: Counter<u64>,
    pub process_duration: Histogram<f64>,
}

impl BridgeMetrics {
    pub fn new(meter: &Meter) -> Self {
        let handshakes = meter
            .u64_counter("themag.agent.handshakes")
            .with_description("WebSocket handshakes by origin decision")
            .build();

        let sessions_opened = meter
            .u64_counter("themag.agent.sessions_opened")
            .with_description("Sessions opened after an accepted handshake")
            .build();

        let processes_spawned = meter
            .u64_counter("themag.agent.processes_spawned")
            .with_description("Shell processes started")
            .build();

        let spawn_failures = meter
            .u64_counter("themag.agent.spawn_failures")
            .with_description("Commands the shell failed to start")
            .build();

        let process_duration = meter
            .f64_histogram("themag.agent.process.duration_ms")
            .with_description("Wall time from spawn to exit in milliseconds")
            .build();

        Self {
            handshakes,
            sessions_opened,
            processes_spawned,
            spawn_failures,
            process_duration,
        }
    }

    pub fn record_handshake(&self, decision: OriginDecision) {
        let attrs = match decision {
            OriginDecision::Allowed(_) => vec![KeyValue::new("outcome", "accepted")],
            OriginDecision::Denied(reason) => vec![
                KeyValue::new("outcome", "rejected"),
                KeyValue::new("reason", reason.as_str()),
            ],
        };
        self.handshakes.add(1, &attrs);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.add(1, &[]);
    }

    pub fn record_spawn(&self, launched: bool) {
        if launched {
            self.processes_spawned.add(1, &[]);
        } else {
            self.spawn_failures.add(1, &[]);
        }
    }

    pub fn record_process_exit(&self, duration_ms: f64, code: i32) {
        self.process_duration.record(
            duration_ms,
            &[KeyValue::new("success", (code == 0).to_string())],
        );
    }
}

/// Initialize OTLP metric export
pub fn init_metrics(
    endpoint: Option<String>,
    service_name: &str,
) -> Result<(SdkMeterProvider, BridgeMetrics)> {
    let endpoint = endpoint.unwrap_or_else(|| "http://localhost:4318".to_string());

    info!("Initializing OTLP telemetry: endpoint={}", endpoint);

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint.clone()),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(Duration::from_secs(30))
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("themag-agentd");
    let metrics = BridgeMetrics::new(&meter);

    Ok((provider, metrics))
}

pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    info!("Shutting down telemetry");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}
