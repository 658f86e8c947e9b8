//! WolfMeta - Metadata Node for a Distributed Filesystem
//!
//! Hosts range-sharded metadata partitions and serves filesystem metadata
//! requests over the packet protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmeta::api::HttpServer;
use wolfmeta::client::MasterClient;
use wolfmeta::config::{LoggingConfig, WolfMetaConfig};
use wolfmeta::metadata::MetadataManager;
use wolfmeta::network::{MetaServer, NetworkClient};
use wolfmeta::proto::{CreatePartitionRequest, OpCode, Packet, ResultCode};

/// WolfMeta - Metadata Node for a Distributed Filesystem
#[derive(Parser)]
#[command(name = "wolfmeta")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmeta.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the metanode
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmeta.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "meta-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show partition status from a node's HTTP API
    Status {
        /// API address to query
        #[arg(short, long, default_value = "localhost:17220")]
        address: String,
    },

    /// Create a partition on a metanode
    CreatePartition {
        /// Metanode packet address
        #[arg(short, long, default_value = "localhost:17210")]
        address: String,

        /// Partition ID
        #[arg(long)]
        id: u64,

        /// Volume name
        #[arg(long)]
        volume: String,

        /// First inode id of the range
        #[arg(long)]
        start: u64,

        /// Last inode id of the range
        #[arg(long)]
        end: u64,

        /// Replica addresses
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = WolfMetaConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Status { address } => run_status(address).await,
        Commands::CreatePartition {
            address,
            id,
            volume,
            start,
            end,
            members,
        } => {
            let req = CreatePartitionRequest {
                partition_id: id,
                volume,
                start,
                end,
                members,
            };
            run_create_partition(cli.config, address, req).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the metanode
async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!("Starting WolfMeta node...");

    let config = WolfMetaConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    std::fs::create_dir_all(config.meta_dir()).with_context(|| {
        format!("failed to create meta directory {}", config.meta_dir().display())
    })?;

    let master = if config.client.master_addrs.is_empty() {
        tracing::info!("No master configured, running standalone");
        None
    } else {
        let master = MasterClient::new(config.client.master_addrs.clone(), config.client.http_timeout())?;
        let registration = master
            .register_meta_node(config.advertise_address())
            .await
            .context("failed to register with the master")?;
        tracing::info!(
            "Registered as node {} of cluster {}",
            registration.node_id,
            registration.cluster
        );
        Some(master)
    };

    let transport = Arc::new(NetworkClient::from_config(&config.network));
    let manager = Arc::new(
        MetadataManager::new(
            config.advertise_address(),
            config.meta_dir(),
            config.partition.clone(),
        )
        .with_proxy(transport.clone()),
    );
    let loaded = manager.start().context("failed to load partitions")?;
    tracing::info!("Node {} serving {} partitions", config.node.id, loaded);

    if let Some(master) = &master {
        let assigned = master
            .assigned_partitions(config.advertise_address())
            .await
            .context("failed to fetch assigned partitions from the master")?;
        let missing = manager.missing_partitions(&assigned);
        if !missing.is_empty() {
            manager.stop().await;
            anyhow::bail!("partitions {:?} are assigned to this node but missing locally", missing);
        }
    }

    let server = Arc::new(MetaServer::new(config.node.listen.clone(), Arc::clone(&manager)));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Meta server error: {}", e);
            }
        })
    };

    let api_task = if config.api.enabled {
        let http = HttpServer::new(config.api.clone(), Arc::clone(&manager));
        Some(tokio::spawn(async move {
            if let Err(e) = http.start().await {
                tracing::error!("HTTP API error: {}", e);
            }
        }))
    } else {
        None
    };

    // Drop pooled proxy connections nobody has used for a while
    let cleanup_task = {
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                transport.cleanup_stale(Duration::from_secs(300));
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    server.stop();
    let _ = server_task.await;
    if let Some(task) = api_task {
        task.abort();
    }
    cleanup_task.abort();
    manager.stop().await;
    transport.close_all();

    tracing::info!("WolfMeta node stopped");
    Ok(())
}

/// Show partition status
async fn run_status(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/partitions", address);

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to get status from {}", address))?;
    let status: serde_json::Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Send a partition create request to a metanode
async fn run_create_partition(
    config_path: PathBuf,
    address: String,
    req: CreatePartitionRequest,
) -> anyhow::Result<()> {
    let network = WolfMetaConfig::from_file(&config_path)
        .map(|config| config.network)
        .unwrap_or_default();
    let client = NetworkClient::from_config(&network);

    let packet = Packet::request(OpCode::CreateMetaPartition, req.partition_id, &req)?;
    let reply = client.request(&address, &packet).await?;

    match reply.result_code() {
        ResultCode::Ok => {
            println!(
                "✓ Partition {} created for {} with range [{}, {}]",
                req.partition_id, req.volume, req.start, req.end
            );
            Ok(())
        }
        code => {
            eprintln!("✗ Partition create failed ({:?}): {}", code, reply.message());
            anyhow::bail!("partition {} was not created", req.partition_id)
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config_content = format!(
        r#"# WolfMeta Configuration
# Generated configuration file

[node]
id = "{node_id}"
listen = "0.0.0.0:17210"
meta_dir = "/var/lib/wolfmeta/{node_id}"
# advertise_address = "my-public-ip:17210"

[partition]
store_interval_secs = 300
store_queue_depth = 5
store_retry_delay_ms = 1000

[network]
connect_timeout_ms = 5000
read_deadline_secs = 15
write_deadline_secs = 15

[client]
volume = ""
master_addrs = []
# master_addrs = ["master-1.example.com:17010", "master-2.example.com:17010"]
refresh_interval_secs = 60
http_timeout_secs = 10

[api]
enabled = true
bind_address = "0.0.0.0:17220"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the metadata directory and master addresses.");
    println!("Then start with: wolfmeta start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfMetaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Listen Address: {}", config.node.listen);
            println!("  Advertise Address: {}", config.advertise_address());
            println!("  Meta Directory: {}", config.meta_dir().display());
            println!("  Store Interval: {:?}", config.partition.store_interval());
            println!("  Masters: {}", config.client.master_addrs.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
