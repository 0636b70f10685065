use anyhow::Result;
use clap::Parser;
use sensor_reconciler::cli::{Args, Mode};
use sensor_reconciler::config::Config;
use sensor_reconciler::probe::TcpLivenessProbe;
use sensor_reconciler::store::{build_pool, PgRecordStore};
use sensor_reconciler::{PassOutcome, Reconciler, TriggerController};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_reconciler=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-reconciler"),
            ])))
            .install_batch(Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
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
    args.apply(&mut config);
    config.validate()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = Arc::new(PgRecordStore::new(pool, config.table.clone()));
    store.ensure_schema().await?;

    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(
        Reconciler::new(store.clone(), config.reconciler_settings()).with_shutdown(shutdown.clone()),
    );
    tracing::info!(
        mode = ?args.mode,
        table = %config.table,
        window = config.window_size,
        granularity = %config.granularity,
        "sensor reconciler starting"
    );

    let exit_code = match args.mode {
        Mode::Once => {
            let report = match reconciler.run_pass().await {
                PassOutcome::Completed(report) => report,
                PassOutcome::Skipped => anyhow::bail!("reconciliation pass unexpectedly skipped"),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.aborted {
                1
            } else {
                0
            }
        }
        Mode::Service => {
            let controller = TriggerController::new(
                reconciler.clone(),
                Arc::new(TcpLivenessProbe::new(
                    config.liveness_host.clone(),
                    config.liveness_port,
                    config.probe_timeout(),
                )),
                config.trigger_settings(),
            );
            let handle = tokio::spawn({
                let cancel = shutdown.clone();
                async move { controller.serve(cancel).await }
            });
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c; shutting down");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "trigger controller task failed");
            }
            0
        }
    };

    store.close().await;
    opentelemetry::global::shutdown_tracer_provider();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
