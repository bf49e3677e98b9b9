//! Quorum Command Line Interface

use clap::{CommandFactory, Parser, Subcommand};
use quorum::raft::{AppendEvent, InMemoryRaftCluster, RaftConfig, Role};
use quorum::snapshot::SnapshotStore;
use quorum::{QuorumError, Result};
use quorum_config::{ConfigLoader, ConfigValidator, LogFormat, LoggingSection, QuorumConfig};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quorum")]
#[command(about = "Quorum replicated log")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the data directory
    Init {
        /// Data directory path
        #[arg(short, long, default_value = "./data")]
        data_dir: PathBuf,

        /// Id of the local node
        #[arg(long, default_value_t = 1)]
        node_id: u64,

        /// Voting members of the partition
        #[arg(long, value_delimiter = ',', default_value = "1")]
        members: Vec<u64>,

        /// Where to write the configuration
        #[arg(short, long, default_value = "quorum.toml")]
        output: PathBuf,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect the snapshot store
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Run an in-process cluster that elects a leader and commits appends
    Demo {
        /// Number of voting members
        #[arg(long, default_value_t = 3)]
        nodes: u64,

        /// Number of entries to append
        #[arg(long, default_value_t = 5)]
        appends: u64,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List persisted snapshots
    List,
    /// Recompute and compare the checksums of the latest snapshot
    Verify,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Init { data_dir, node_id, members, output }) => {
            handle_init(&data_dir, node_id, members, &output).await
        }
        Some(Commands::Config { command }) => match load_config(cli.config.as_deref()).await {
            Ok(config) => handle_config(command, &config),
            Err(e) => Err(e),
        },
        Some(Commands::Snapshot { command }) => match load_config(cli.config.as_deref()).await {
            Ok(config) => {
                init_logging(&config.logging);
                handle_snapshot(command, &config).await
            }
            Err(e) => Err(e),
        },
        Some(Commands::Demo { nodes, appends }) => match load_config(cli.config.as_deref()).await {
            Ok(config) => {
                init_logging(&config.logging);
                handle_demo(&config, nodes, appends).await
            }
            Err(e) => Err(e),
        },
        Some(Commands::Version) => {
            println!("quorum {}", quorum::VERSION);
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn load_config(path: Option<&Path>) -> Result<QuorumConfig> {
    let loader = ConfigLoader::new();
    match path {
        Some(path) => loader.load_from_file(path).await,
        None => loader.load().await,
    }
}

/// `RUST_LOG` takes precedence over the configured level
fn init_logging(logging: &LoggingSection) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_filter()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

async fn handle_init(data_dir: &Path, node_id: u64, members: Vec<u64>, output: &Path) -> Result<()> {
    let mut config = QuorumConfig::default();
    config.cluster.node_id = node_id;
    config.cluster.members = members;
    config.cluster.data_directory = data_dir.to_path_buf();
    ConfigValidator::validate(&config)?;

    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|e| QuorumError::internal(format!("Failed to create data directory: {}", e)))?;

    if output.exists() {
        println!("Configuration already exists at: {}", output.display());
    } else {
        ConfigLoader::new().save_to_file(&config, output).await?;
        println!("Created default configuration at: {}", output.display());
    }

    println!("Data directory: {}", data_dir.display());
    Ok(())
}

fn handle_config(command: ConfigCommands, config: &QuorumConfig) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let text = toml::to_string_pretty(config)
                .map_err(|e| QuorumError::config(format!("Failed to serialize configuration: {}", e)))?;
            println!("{}", text);
        }
        ConfigCommands::Validate => {
            ConfigValidator::validate(config)?;
            println!("Configuration is valid");
        }
    }
    Ok(())
}

fn snapshot_root(config: &QuorumConfig) -> PathBuf {
    config
        .cluster
        .data_directory
        .join(config.cluster.partition().to_string())
        .join(&config.snapshot.directory)
}

async fn handle_snapshot(command: SnapshotCommands, config: &QuorumConfig) -> Result<()> {
    let store = SnapshotStore::open(snapshot_root(config)).await.map_err(QuorumError::snapshot)?;

    match command {
        SnapshotCommands::List => {
            let ids = store.list_snapshots().await.map_err(QuorumError::snapshot)?;
            if ids.is_empty() {
                println!("No snapshots");
            }
            for id in ids {
                println!(
                    "{}  index={} term={} processed={} exporter={}",
                    id, id.index, id.term, id.processed_position, id.exporter_position
                );
            }
        }
        SnapshotCommands::Verify => {
            let Some(snapshot) = store.latest_snapshot().await else {
                println!("No snapshots");
                return Ok(());
            };
            snapshot.verify().await.map_err(QuorumError::snapshot)?;
            let chunks = snapshot
                .chunk_count(config.snapshot.chunk_size)
                .await
                .map_err(QuorumError::snapshot)?;
            println!(
                "Snapshot {} is intact ({} files, {} chunks)",
                snapshot.id(),
                snapshot.manifest().files.len(),
                chunks
            );
        }
    }
    Ok(())
}

async fn handle_demo(config: &QuorumConfig, nodes: u64, appends: u64) -> Result<()> {
    let raft_config = RaftConfig::from(&config.raft);
    raft_config.validate().map_err(QuorumError::consensus)?;

    let cluster = InMemoryRaftCluster::start((1..=nodes).collect(), raft_config)
        .await
        .map_err(QuorumError::consensus)?;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(30))
        .await
        .map_err(QuorumError::consensus)?;
    let status = leader.current_status();
    info!("Node {} elected leader in term {}", status.id, status.term);

    for position in 1..=appends {
        let mut events = leader.append(position, position, format!("record-{}", position).into_bytes());
        while let Some(event) = events.recv().await {
            match event {
                AppendEvent::Written(indexed) => info!("Wrote entry {} at index {}", position, indexed.index()),
                AppendEvent::Committed(indexed) => {
                    println!("Committed position {} at index {}", position, indexed.index());
                    break;
                }
                AppendEvent::WriteFailed(e) | AppendEvent::CommitFailed(_, e) => {
                    cluster.shutdown().await;
                    return Err(QuorumError::consensus(e));
                }
            }
        }
    }

    for handle in cluster.handles() {
        let status = handle.status().await.map_err(QuorumError::consensus)?;
        let role = if status.role == Role::Leader { "leader" } else { "member" };
        println!(
            "node {} ({}): term={} last_index={} commit_index={}",
            status.id, role, status.term, status.last_log_index, status.commit_index
        );
    }

    cluster.shutdown().await;
    Ok(())
}
