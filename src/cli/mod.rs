// Command line interface for the seed-ping node
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::info;

use crate::config::manager::ConfigManager;
use crate::config::AppConfig;
use crate::discovery::{PingCollection, PingStatsSnapshot};
use crate::logging::LoggingManager;
use crate::node::SeedPingNode;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "SEEDPING_CONFIG_PATH";

/// Seed-ping discovery node
#[derive(Parser, Debug)]
#[command(name = "seed-ping")]
#[command(about = "Unicast gossip ping discovery node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global command line arguments
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Configuration file path (YAML, or JSON by extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directive
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format (text, json, yaml)
    #[arg(long, global = true, default_value = "text")]
    pub output_format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Output formats
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node that answers pings and discovers peers periodically
    Start(StartArgs),

    /// Run a single discovery round and print the peers found
    Ping(PingArgs),

    /// Configuration management
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Listen address override
    #[arg(short, long)]
    pub listen_address: Option<SocketAddr>,

    /// Seed hosts, replacing the configured ones
    #[arg(short, long, value_delimiter = ',')]
    pub seeds: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Seed hosts, replacing the configured ones
    #[arg(short, long, value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// Round duration in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,

    /// Cluster name override
    #[arg(long)]
    pub cluster_name: Option<String>,
}

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the effective configuration
    Validate,
}

/// Result of a one-off round, as printed by `ping`
#[derive(Debug, Serialize)]
pub struct PingOutput {
    pub local_node: String,
    pub finished_at: DateTime<Utc>,
    pub peers: Vec<PeerSummary>,
    pub stats: PingStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
    pub address: SocketAddr,
    pub master_eligible: bool,
    pub master: Option<String>,
    pub cluster_name: String,
    pub term: u64,
    pub version: u64,
}

impl PingOutput {
    pub fn new(local_node: String, collection: &PingCollection, stats: PingStatsSnapshot) -> Self {
        let peers = collection
            .to_list()
            .into_iter()
            .map(|response| PeerSummary {
                master_eligible: response.is_master_eligible(),
                id: response.node.id,
                name: response.node.name,
                address: response.node.address,
                master: response.master.map(|master| master.id),
                cluster_name: response.cluster_name.0,
                term: response.state.term,
                version: response.state.version,
            })
            .collect();
        Self {
            local_node,
            finished_at: Utc::now(),
            peers,
            stats,
        }
    }

    pub fn render(&self, format: OutputFormat) -> CliResult<String> {
        Ok(match format {
            OutputFormat::Json => serde_json::to_string_pretty(self)?,
            OutputFormat::Yaml => serde_yaml::to_string(self)?,
            OutputFormat::Text => {
                let mut out = format!(
                    "{} peer(s) found from {} at {}\n",
                    self.peers.len(),
                    self.local_node,
                    self.finished_at.to_rfc3339()
                );
                for peer in &self.peers {
                    out.push_str(&format!(
                        "  {} [{}] {}{} master={} state={}/{}\n",
                        peer.name,
                        peer.id,
                        peer.address,
                        if peer.master_eligible { " (master-eligible)" } else { "" },
                        peer.master.as_deref().unwrap_or("-"),
                        peer.term,
                        peer.version,
                    ));
                }
                out
            }
        })
    }
}

/// CLI application
pub struct CliApp {
    config_manager: ConfigManager,
}

impl CliApp {
    pub fn new(global: &GlobalArgs) -> Self {
        let config_path = global
            .config
            .clone()
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("seed-ping.yaml"));
        Self {
            config_manager: ConfigManager::new(config_path),
        }
    }

    /// Run the parsed command line
    pub async fn run(&mut self, cli: Cli) -> CliResult {
        self.config_manager.load().await?;
        self.config_manager.load_from_env().await?;
        let mut config = self.config_manager.get_config().await;
        if let Some(level) = &cli.global.log_level {
            config.logging.level = level.clone();
        }
        if cli.global.no_color {
            config.logging.enable_colors = false;
        }
        self.config_manager.update_config(config.clone()).await;

        match cli.command {
            Commands::Start(args) => {
                LoggingManager::new(config.logging.clone()).initialize()?;
                self.handle_start(config, args).await
            }
            Commands::Ping(args) => {
                LoggingManager::new(config.logging.clone()).initialize()?;
                self.handle_ping(config, args, cli.global.output_format).await
            }
            Commands::Config(command) => self.handle_config(command, cli.global.output_format).await,
        }
    }

    async fn handle_start(&mut self, mut config: AppConfig, args: StartArgs) -> CliResult {
        if let Some(listen_address) = args.listen_address {
            config.node.listen_address = listen_address;
        }
        if !args.seeds.is_empty() {
            config.discovery.seed_hosts = args.seeds;
        }
        crate::config::manager::validate(&config)?;

        let node = SeedPingNode::start(config).await?;
        info!(address = %node.bound_address(), "press ctrl-c to stop");
        node.run_until(async {
            let _ = signal::ctrl_c().await;
        })
        .await;
        info!("received shutdown signal");
        node.stop().await;
        Ok(())
    }

    async fn handle_ping(&mut self, mut config: AppConfig, args: PingArgs, format: OutputFormat) -> CliResult {
        // an ephemeral listener so peers can answer without clashing with a running node
        config.node.listen_address = SocketAddr::new(config.node.listen_address.ip(), 0);
        if !args.seeds.is_empty() {
            config.discovery.seed_hosts = args.seeds;
        }
        if let Some(timeout_ms) = args.timeout_ms {
            config.discovery.ping_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(cluster_name) = args.cluster_name {
            config.node.cluster_name = cluster_name;
        }
        crate::config::manager::validate(&config)?;

        let node = SeedPingNode::start(config).await?;
        let result = node.discover().await;
        let stats = node.ping().stats();
        let local = node.local_node().to_string();
        node.stop().await;

        let output = PingOutput::new(local, &result?, stats);
        print!("{}", output.render(format)?);
        Ok(())
    }

    async fn handle_config(&mut self, command: ConfigCommand, format: OutputFormat) -> CliResult {
        match command.action {
            ConfigAction::Show => {
                let config = self.config_manager.get_config().await;
                let rendered = match format {
                    OutputFormat::Json => serde_json::to_string_pretty(&config)?,
                    OutputFormat::Text | OutputFormat::Yaml => serde_yaml::to_string(&config)?,
                };
                println!("{}", rendered);
            }
            ConfigAction::Validate => {
                self.config_manager.validate().await?;
                println!("configuration at {:?} is valid", self.config_manager.get_config_path());
            }
        }
        Ok(())
    }
}
