use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use statbridge::collector;
use statbridge::config::Config;
use statbridge::exporter;
use statbridge::identity;
use statbridge::types::MonitoredServer;

#[derive(Parser, Debug)]
#[command(name = "statbridge", about = "Prometheus exporter for server status endpoints")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/statbridge/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("statbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        servers = config.servers.len(),
        "Starting statbridge"
    );

    // Run the exporter
    if let Err(e) = run(config).await {
        error!(error = %e, "Exporter terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.exporter.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    // Shared HTTP transport for every collector and identity probe
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.exporter.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    // Shutdown signal, shared by the identity retry loops and the server
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, exiting");
            let _ = shutdown_tx.send(true);
        }
    });

    // Resolve identities for servers without a configured ID
    let retry = Duration::from_secs(config.exporter.id_retry_interval_secs);
    let mut servers = Vec::with_capacity(config.servers.len());
    for sc in &config.servers {
        let id = match sc.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let mut rx = shutdown_rx.clone();
                identity::resolve_server_id(&client, &sc.url, retry, &mut rx).await?
            }
        };
        info!(server = %id, url = %sc.url, "Monitoring server");
        servers.push(MonitoredServer { id, url: sc.url.clone() });
    }

    // Build and register one collector per subsystem endpoint
    let registry = prometheus::Registry::new();
    for target in &config.collect {
        let counter_fields: HashSet<String> = target.counter_fields.iter().cloned().collect();
        for endpoint in &target.endpoints {
            let c = collector::create_collector(
                client.clone(),
                target.subsystem,
                endpoint,
                config.exporter.namespace.as_deref(),
                &config.exporter.labels,
                &counter_fields,
                &servers,
            )
            .await;
            if let Err(e) = registry.register(c) {
                warn!(
                    subsystem = %target.subsystem,
                    endpoint = %endpoint,
                    error = %e,
                    "Skipping collector registration"
                );
            }
        }
    }

    exporter::serve(&config.exporter.listen_addr, registry, shutdown_rx).await
}
