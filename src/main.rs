use alert_engine::config::Config;
use alert_engine::db::build_pool;
use alert_engine::engine::{EngineSettings, EvaluationLoop};
use alert_engine::store::{PgStore, Stores};
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "alert-engine", about = "Evaluates alert rules against device rollups")]
struct Args {
    /// Run one evaluation pass for every tenant and exit.
    #[arg(long)]
    once: bool,

    /// Only evaluate these tenants (repeatable). Overrides ENGINE_TENANTS.
    #[arg(long = "tenant", value_name = "UUID")]
    tenants: Vec<Uuid>,
}

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,alert_engine=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "alert-engine"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() || trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if !args.tenants.is_empty() {
        config.tenants = args.tenants.clone();
    }
    init_tracing(&config)?;

    let pool = build_pool(
        &config.database_url,
        config.db_pool_size,
        config.store_timeout(),
    )
    .await?;
    let stores = Stores::single(Arc::new(PgStore::new(pool)));
    let settings = EngineSettings::from_config(&config);
    tracing::info!(
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        cycle_deadline_ms = settings.cycle_deadline.as_millis() as u64,
        store_timeout_ms = settings.store_timeout.as_millis() as u64,
        staleness_threshold_seconds = settings.staleness_threshold_seconds,
        max_window_keys = settings.max_window_keys,
        tenants = config.tenants.len(),
        "alert-engine starting"
    );
    let engine = EvaluationLoop::new(stores, settings);

    if args.once {
        let reports = Arc::new(engine).tick().await?;
        let fired: usize = reports.iter().map(|report| report.fired).sum();
        tracing::info!(tenants = reports.len(), fired, "single evaluation pass complete");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut handle = engine.start(cancel.clone());
    tokio::select! {
        res = &mut handle => {
            if let Err(err) = res {
                tracing::error!(error = %err, "evaluation loop task failed");
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    if let Err(err) = handle.await {
        tracing::warn!(error = %err, "evaluation loop did not stop cleanly");
    }
    Ok(())
}
