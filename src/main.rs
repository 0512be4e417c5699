//! ShardRep - Write Replication Coordinator
//!
//! Command line front end: manages the configuration file, checks write
//! consistency over the configured topology and runs the in-process
//! simulated cluster.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardrep::config::ShardRepConfig;
use shardrep::error::Result;
use shardrep::replication::WriteConsistencyLevel;
use shardrep::simulation::{build_cluster_state, consistency_per_shard, SimulatedCluster};

/// ShardRep - Write Replication Coordinator
#[derive(Parser)]
#[command(name = "shardrep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardrep.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardrep.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node and topology information
    Info,

    /// Check write consistency over the configured topology
    Check {
        /// Level to check (default, one, quorum, all); all levels when omitted
        #[arg(short, long)]
        level: Option<String>,
    },

    /// Run writes through the simulated cluster and print the report as JSON
    Simulate {
        /// Writes per shard (overrides the config file)
        #[arg(short, long)]
        writes: Option<usize>,

        /// Pretty-print the JSON report
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let (level, format) = logging_settings(&cli);
    init_logging(&level, &format);

    match cli.command {
        Commands::Init { output, node_id } => {
            run_init(output, node_id)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
        Commands::Info => {
            run_info(cli.config)
        }
        Commands::Check { level } => {
            run_check(cli.config, level)
        }
        Commands::Simulate { writes, pretty } => {
            run_simulate(cli.config, writes, pretty).await
        }
    }
}

/// Level and format from the CLI, then the config file, then defaults
fn logging_settings(cli: &Cli) -> (String, String) {
    let from_config = ShardRepConfig::from_file(&cli.config)
        .ok()
        .map(|c| (c.logging.level, c.logging.format));
    let (level, format) = from_config.unwrap_or_else(|| ("info".to_string(), "pretty".to_string()));
    (cli.log_level.clone().unwrap_or(level), format)
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# ShardRep Configuration
# Generated configuration file

[node]
id = "{node_id}"

[replication]
# Level used by requests that do not set one: one, quorum, all
default_consistency = "quorum"
check_write_consistency = true
# Disable for shadow replicas that share the primary's storage
execute_on_replicas = true
replica_timeout_ms = 5000
shard_failed_timeout_ms = 5000
op_type = "index"

[logging]
level = "info"
format = "pretty"

[simulation]
index = "docs"
shards = 1
writes = 100
concurrency = 8
latency_ms = 1
jitter_ms = 4
# primary_relocating_to = "node-9"

[[simulation.replicas]]
node = "node-2"

[[simulation.replicas]]
node = "node-3"
# state = "relocating"
# relocating_to = "node-4"
# fault = "corrupt"       # none, not_started, corrupt, unresponsive
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to describe your shard topology.");
    println!("Then run: shardrep --config {} simulate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ShardRepConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Default Consistency: {}", config.replication.default_consistency);
            println!("  Index: {} ({} shards)", config.simulation.index, config.simulation.shards);
            println!("  Copies per Shard: {}", config.copies_per_shard());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node and topology information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ShardRepConfig::from_file(&config_path)?;
    let state = build_cluster_state(&config);

    println!("ShardRep Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!();
    println!("Replication Configuration:");
    println!("  Consistency:    {}", config.replication.default_consistency);
    println!("  Check Writes:   {}", config.replication.check_write_consistency);
    println!("  Replicate:      {}", config.replication.execute_on_replicas);
    println!("  Timeout:        {} ms", config.replication.replica_timeout_ms);
    println!("  Operation:      {}", config.replication.op_type);
    println!();
    println!("Simulation:");
    println!("  Writes:         {} per shard", config.simulation.writes);
    println!("  Concurrency:    {}", config.simulation.concurrency);
    println!("  Latency:        {} ms (+{} ms jitter)", config.simulation.latency_ms, config.simulation.jitter_ms);
    for replica in &config.simulation.replicas {
        println!(
            "  Replica:        {} {} fault={}",
            replica.node.as_deref().unwrap_or("(unassigned)"),
            replica.state,
            replica.fault
        );
    }
    println!();
    println!("Routing Table:");
    print!("{}", state.pretty_print());

    Ok(())
}

/// Check write consistency for one or every level
fn run_check(config_path: PathBuf, level: Option<String>) -> Result<()> {
    let config = ShardRepConfig::from_file(&config_path)?;
    let state = build_cluster_state(&config);
    let levels = match level {
        Some(level) => vec![level.parse::<WriteConsistencyLevel>()?],
        None => vec![
            WriteConsistencyLevel::One,
            WriteConsistencyLevel::Quorum,
            WriteConsistencyLevel::All,
        ],
    };

    let default = config.replication.default_consistency;
    for level in levels {
        println!("{} (resolves to {}):", level, level.resolve(default));
        for (shard_id, outcome) in consistency_per_shard(&state, level, default) {
            match outcome {
                Ok(()) => println!("  ✓ {}", shard_id),
                Err(e) => println!("  ✗ {}", e),
            }
        }
    }

    Ok(())
}

/// Run the simulated cluster
async fn run_simulate(config_path: PathBuf, writes: Option<usize>, pretty: bool) -> Result<()> {
    let mut config = ShardRepConfig::from_file(&config_path)?;
    if let Some(writes) = writes {
        config.simulation.writes = writes;
    }
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let cluster = SimulatedCluster::start(config)?;
    let report = cluster.run().await;
    cluster.shutdown();
    let report = report?;

    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    Ok(())
}
