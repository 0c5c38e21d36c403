//! Wolpertinger node
//!
//! Command-line entry point: configuration helpers and an in-process demo.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use wolpertinger::components::core::CoreClient;
use wolpertinger::components::fileshare::FileShareClient;
use wolpertinger::config::{default_config_path, Config};
use wolpertinger::transport::MemoryHub;
use wolpertinger::ConnectionManager;
use wolpertinger_protocol::{AuthToken, ClusterSecret};

/// Wolpertinger - peer-to-peer component RPC node.
#[derive(Parser, Debug)]
#[command(name = "wolpertinger")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run two nodes in-process and walk through the handshake
    Demo {
        /// File to hash remotely (defaults to this executable)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Print a fresh random cluster secret
    GenSecret,

    /// Print the cluster auth key for a secret and token
    ClusterKey {
        /// Hex-encoded cluster secret
        #[arg(long)]
        secret: String,

        /// Challenge token
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.node.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo { file } => {
            config.validate()?;
            let file = match file {
                Some(file) => file,
                None => std::env::current_exe().context("Failed to locate current executable")?,
            };
            run_demo(config, file).await?;
        }
        Commands::InitConfig { force } => {
            let path = cli.config.unwrap_or_else(default_config_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        Commands::GenSecret => {
            println!("{}", ClusterSecret::generate().as_hex());
        }
        Commands::ClusterKey { secret, token } => {
            let secret = ClusterSecret::from_hex(&secret)?;
            let key = secret.auth_key(&AuthToken::from_string(token));
            println!("{}", key.as_str());
        }
    }

    Ok(())
}

/// Configurations for the two demo nodes, sharing one cluster secret.
fn demo_configs(base: &Config) -> (Config, Config) {
    let secret = ClusterSecret::generate();
    let password = base
        .security
        .admin_password
        .clone()
        .unwrap_or_else(|| "wolpertinger".to_string());

    let mut alpha = base.clone();
    alpha.node.name = "alpha".to_string();
    alpha.security.cluster_secret = Some(secret.as_hex().to_string());
    alpha.security.admin_password = Some(password.clone());
    alpha.security.require_peer_cluster_auth = true;

    let mut beta = alpha.clone();
    beta.node.name = "beta".to_string();
    beta.security.accept_unsolicited = false;
    beta.security.allowed_peers = vec!["alpha".to_string()];
    beta.security.admin_password = Some(password);

    (alpha, beta)
}

async fn run_demo(config: Config, file: PathBuf) -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let (alpha_config, beta_config) = demo_configs(&config);

    let (alpha_transport, alpha_rx) = hub.endpoint(alpha_config.node.name.clone());
    let (beta_transport, beta_rx) = hub.endpoint(beta_config.node.name.clone());
    let alpha = Arc::new(ConnectionManager::new(alpha_config, Arc::new(alpha_transport))?);
    let beta = Arc::new(ConnectionManager::new(beta_config, Arc::new(beta_transport))?);
    alpha.spawn_inbound(alpha_rx);
    beta.spawn_inbound(beta_rx);
    beta.spawn_maintenance();

    let (connection, report) = alpha
        .connect_and_authenticate(beta.local_peer())
        .await
        .context("Handshake failed")?;
    tracing::info!(
        remote_trust = %report.remote_trust,
        peer_verified = report.peer_cluster_verified,
        "alpha authenticated to beta"
    );
    println!(
        "handshake: trust granted by beta = {}, session key {}",
        report.remote_trust,
        report.session_key.fingerprint()
    );

    let core = CoreClient::new(&connection);
    core.heartbeat().await.context("Heartbeat failed")?;
    println!("heartbeat: ok (beta runs version {})", core.version().await?);

    let path = file.display().to_string();
    let digest = FileShareClient::new(&connection)
        .file_hash(&path)
        .await
        .with_context(|| format!("Hashing {path} on beta failed"))?;
    println!("sha256({path}) = {digest}");

    alpha.shutdown().await;
    beta.shutdown().await;
    Ok(())
}
