use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meta_sentinel::config::{Config, ConfigError};
use meta_sentinel::utils::format_duration;
use meta_sentinel::{ConnectionPool, SentinelClient};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meta-sentinel")]
#[command(about = "Sentinel-aware failover access layer for the metadata store")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the Sentinels once and print the current topology
    Topology {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/meta-sentinel.toml")]
        config: PathBuf,
    },
    /// Build the connection pool and follow topology changes until Ctrl+C
    Watch {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/meta-sentinel.toml")]
        config: PathBuf,
        /// Seconds between pool health reports
        #[arg(long, default_value_t = 30)]
        report_interval: u64,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Topology { config } => show_topology(config).await,
        Commands::Watch {
            config,
            report_interval,
        } => watch(config, report_interval).await,
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from_file(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    if !config.replication.enabled {
        bail!("Replication is disabled in {:?}", path);
    }
    Ok(config)
}

async fn show_topology(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config)?;

    let client = SentinelClient::connect(config.sentinel_options()).await;

    let (all_connected, missing) = client.check_connectivity().await;
    println!("Master: {}", client.master_name());
    println!(
        "Sentinels: {}/{} connected",
        config.replication.sentinels.len() - missing.len(),
        config.replication.sentinels.len()
    );
    if !all_connected {
        for endpoint in &missing {
            println!("  unreachable: {}", endpoint);
        }
    }

    let (healthy, unhealthy) = client.check_health().await;
    if !healthy {
        for endpoint in &unhealthy {
            println!("  unhealthy: {}", endpoint);
        }
    }

    let primary = client
        .query_primary()
        .await
        .context("Failed to resolve primary")?;
    println!("Primary: {}", primary);

    let replicas = client
        .query_replicas()
        .await
        .context("Failed to resolve replicas")?;
    println!("Replicas: {}", replicas.len());
    for replica in &replicas {
        println!("  {}", replica);
    }

    Ok(())
}

async fn watch(config_path: PathBuf, report_interval: u64) -> Result<()> {
    let config = load_config(&config_path)?;
    init_logging(&config)?;

    info!(
        "Starting meta-sentinel v{} for master '{}'",
        env!("CARGO_PKG_VERSION"),
        config.replication.master_name
    );
    info!("Configuration loaded from: {:?}", config_path);

    let client = SentinelClient::connect(config.sentinel_options()).await;
    let pool = ConnectionPool::new(client.clone(), config.pool_options());
    if !pool.initialize().await {
        bail!(
            "No primary available for master '{}'",
            config.replication.master_name
        );
    }
    if !client.start_monitoring().await {
        bail!("No Sentinel reachable, cannot monitor topology");
    }

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let healthy = pool.check_connections_health().await;
                let total = usize::from(pool.primary_addr().await.is_some()) + pool.replica_count().await;
                if healthy < total {
                    warn!(healthy, total, "Unhealthy pooled connections, refreshing");
                    pool.refresh_connections().await;
                } else {
                    info!(
                        healthy,
                        total,
                        uptime = %format_duration(started.elapsed()),
                        "Pool healthy"
                    );
                }
            }
        }
    }

    client.stop_monitoring().await;
    info!("meta-sentinel stopped");
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  meta-sentinel watch --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Master name: {}", config.replication.master_name);
            println!(
                "  Replication: {}",
                if config.replication.enabled { "enabled" } else { "disabled" }
            );
            println!("  Sentinels: {} instances", config.replication.sentinels.len());
            for (i, endpoint) in config.replication.sentinels.iter().enumerate() {
                println!("    {}: {}", i + 1, endpoint);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("meta-sentinel v{}", env!("CARGO_PKG_VERSION"));
    println!("Sentinel-aware failover access layer for the metadata store");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Primary/replica discovery through Redis Sentinel");
    println!("  • Background topology monitoring with change callbacks");
    println!("  • Round-robin replica reads with primary fallback");
    println!("  • Transparent reconnect-and-retry on failover");
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
