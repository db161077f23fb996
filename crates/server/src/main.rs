use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod runtime;

use config::{AppState, ServerConfig};

const DEFAULT_FILTER: &str = "sagaflow=info,sagaflow_core=info,tower_http=debug";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "sagaflow")]
#[command(about = "Durable DAG workflow engine with saga compensation", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sagaflow.toml", env = "SAGAFLOW_CONFIG")]
    config: PathBuf,

    /// Directory holding the transition log and archives
    #[arg(short, long, default_value = "./data", env = "SAGAFLOW_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", env = "SAGAFLOW_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.with_file(true).with_line_number(true).init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("Starting sagaflow {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    tracing::info!(
        "Storage: {:?} under {}",
        config.storage.backend,
        config.data_dir.display()
    );
    let state = AppState::new(&config)?;

    // Instances that were mid-flight when the process last stopped
    let recovered = state.engine.recover_all().await?;
    if !recovered.is_empty() {
        tracing::info!("Recovered {} unfinished instances", recovered.len());
    }

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, state).await?;

    tracing::info!("sagaflow stopped");
    Ok(())
}
