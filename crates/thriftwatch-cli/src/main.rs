use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use thriftwatch_fetch::{HttpClient, HttpClientConfig, SearchPageSource};
use thriftwatch_notify::WebhookSink;
use thriftwatch_scan::{load_alerts_file, AlertStore, ScanConfig, Scanner};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "thriftwatch-cli")]
#[command(about = "Thriftwatch marketplace alert bot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scan loop and the dashboard together.
    Run,
    /// Run a single scan cycle and print its summary.
    Scan,
    /// Serve the dashboard only.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Scan => scan_once(config).await,
        Commands::Serve => {
            let store = load_store(&config)?;
            thriftwatch_web::serve_from_env(store).await
        }
    }
}

fn load_store(config: &ScanConfig) -> Result<Arc<AlertStore>> {
    let alerts = load_alerts_file(&config.alerts_file)?;
    info!(alerts = alerts.len(), file = %config.alerts_file, "loaded alert configuration");
    Ok(Arc::new(AlertStore::new(alerts)?))
}

fn build_scanner(config: &ScanConfig, store: Arc<AlertStore>) -> Result<Scanner> {
    let http = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
    })?;
    let sink = WebhookSink::new(Duration::from_secs(config.webhook_timeout_secs))?;
    Ok(Scanner::new(
        store,
        Box::new(SearchPageSource::new(http)),
        Box::new(sink),
        config.scan_interval(),
    ))
}

async fn run(config: ScanConfig) -> Result<()> {
    let store = load_store(&config)?;
    let mut scanner = build_scanner(&config, Arc::clone(&store))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let web_store = Arc::clone(&store);
    let server = tokio::spawn(async move {
        if let Err(err) = thriftwatch_web::serve_from_env(web_store).await {
            error!(error = %err, "dashboard server exited");
        }
    });
    let scan = tokio::spawn(async move { scanner.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    scan.await?;
    server.abort();
    Ok(())
}

async fn scan_once(config: ScanConfig) -> Result<()> {
    let store = load_store(&config)?;
    let mut scanner = build_scanner(&config, store)?;
    let summary = scanner.run_cycle().await;
    println!(
        "scan complete: cycle={} alerts={} failed={} evaluated={} dispatched={}",
        summary.cycle_id,
        summary.alerts_scanned,
        summary.alerts_failed,
        summary.listings_evaluated,
        summary.matches_dispatched
    );
    Ok(())
}
