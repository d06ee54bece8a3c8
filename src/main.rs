mod cli;
mod config;
mod coordinator;
mod mqtt;
mod normalize;
mod pipeline;
mod replay;
mod store;
mod telemetry;

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::coordinator::{shutdown_signal, Coordinator, ShutdownReport};
use crate::store::InfluxStore;
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,lorawan_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "lorawan-ingest"),
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

async fn run(cli: Cli, config: Config) -> Result<ShutdownReport> {
    let store = Arc::new(InfluxStore::new(&config.influx)?);
    let coordinator = Coordinator::new(config, store);
    match cli.command() {
        Commands::Live => coordinator.run_live(shutdown_signal()).await,
        Commands::Replay(args) => {
            let report = coordinator
                .run_replay(&args.file, shutdown_signal())
                .await?;
            if let Some(summary) = &report.replay {
                println!("{}", serde_json::to_string_pretty(summary)?);
            }
            Ok(report)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = init_tracing(&config) {
        eprintln!("failed to initialise tracing: {err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli, config).await {
        Ok(report) if report.clean => {
            tracing::info!(stats = ?report.stats, "shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            tracing::error!(stats = ?report.stats, "shutdown was forced before the sink drained");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "lorawan-ingest failed");
            ExitCode::FAILURE
        }
    }
}
