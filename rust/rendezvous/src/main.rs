//! NCCL Identifier Rendezvous
//!
//! Runs one rendezvous and prints the shared identifier. Rank 0 generates
//! the identifier and pushes it to every peer; every other rank listens on
//! its endpoint until rank 0 delivers it.
//!
//! # Usage
//!
//! ```bash
//! # On each peer
//! nccl-rendezvous --rank 1 --endpoint 0.0.0.0:29500
//!
//! # On rank 0
//! nccl-rendezvous --rank 0 --other-endpoints node1:29500,node2:29500
//!
//! # With a configuration file, writing raw bytes instead of hex
//! nccl-rendezvous --config rendezvous.toml --output /tmp/ncclid.bin
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rendezvous_core::{RendezvousConfig, RendezvousCoordinator, RendezvousRequest};

/// NCCL unique-id rendezvous
#[derive(Parser, Debug)]
#[command(name = "nccl-rendezvous")]
#[command(about = "Share an NCCL unique id between the ranks of a job")]
struct Args {
    /// Rank of this process; 0 generates and broadcasts
    #[arg(short, long)]
    rank: Option<u32>,

    /// Address this process listens on (required for rank != 0)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Comma-separated peer addresses rank 0 sends to
    #[arg(long, value_delimiter = ',')]
    other_endpoints: Option<Vec<String>>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name the identifier travels under
    #[arg(long)]
    variable_name: Option<String>,

    /// Broadcast deadline in milliseconds (0 waits forever)
    #[arg(long)]
    broadcast_timeout_ms: Option<u64>,

    /// Receive deadline in milliseconds (0 waits forever)
    #[arg(long)]
    receive_timeout_ms: Option<u64>,

    /// Retries for transient RPC failures
    #[arg(long)]
    max_retries: Option<u32>,

    /// Write the raw identifier bytes here instead of printing hex
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Layers command-line values over `config`.
    fn apply(&self, mut config: RendezvousConfig) -> RendezvousConfig {
        if let Some(rank) = self.rank {
            config.rendezvous.rank = rank;
        }
        if let Some(endpoint) = &self.endpoint {
            config.rendezvous.endpoint = endpoint.clone();
        }
        if let Some(peers) = &self.other_endpoints {
            config.rendezvous.other_endpoints = peers
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(name) = &self.variable_name {
            config.rendezvous.variable_name = name.clone();
        }
        if let Some(ms) = self.broadcast_timeout_ms {
            config.timeouts.broadcast_timeout_ms = ms;
        }
        if let Some(ms) = self.receive_timeout_ms {
            config.timeouts.receive_timeout_ms = ms;
        }
        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }
        config
    }

    fn load_config(&self) -> rendezvous_core::Result<RendezvousConfig> {
        let base = match &self.config {
            Some(path) => RendezvousConfig::read_file(path)?,
            None => RendezvousConfig::default(),
        };
        let config = self.apply(base.with_env_overrides());
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for the identifier
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = args.load_config()?;
    let request = RendezvousRequest::from(&config.rendezvous);

    tracing::info!("Starting NCCL rendezvous");
    tracing::info!("  Rank: {}", request.rank);
    if request.rank == 0 {
        tracing::info!("  Peers: {}", request.other_endpoints.join(","));
    } else {
        tracing::info!("  Endpoint: {}", request.endpoint);
    }

    let coordinator = RendezvousCoordinator::new(config)?;
    let id = coordinator.run(&request).await?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, id.as_bytes())?;
            tracing::info!("Wrote identifier to {}", path.display());
        }
        None => println!("{}", id.to_hex()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_peer_list() {
        let args = Args::try_parse_from([
            "nccl-rendezvous",
            "--rank",
            "0",
            "--other-endpoints",
            "node1:29500,node2:29500",
        ])
        .unwrap();

        let config = args.apply(RendezvousConfig::default());
        assert_eq!(config.rendezvous.rank, 0);
        assert_eq!(
            config.rendezvous.other_endpoints,
            vec!["node1:29500".to_string(), "node2:29500".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[rendezvous]
rank = 1
endpoint = "127.0.0.1:29500"

[timeouts]
receive_timeout_ms = 1000
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = Args::try_parse_from([
            "nccl-rendezvous",
            "--config",
            path.as_str(),
            "--receive-timeout-ms",
            "0",
            "--variable-name",
            "MY_ID",
        ])
        .unwrap();

        let base = RendezvousConfig::read_file(args.config.as_ref().unwrap()).unwrap();
        let config = args.apply(base);
        assert_eq!(config.rendezvous.rank, 1);
        assert_eq!(config.rendezvous.endpoint, "127.0.0.1:29500");
        assert_eq!(config.timeouts.receive_timeout_ms, 0);
        assert_eq!(config.rendezvous.variable_name, "MY_ID");
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let args = Args::try_parse_from(["nccl-rendezvous"]).unwrap();
        let config = args.apply(RendezvousConfig::default());
        assert_eq!(config.rendezvous.variable_name, "NCCLID");
        assert_eq!(config.timeouts.broadcast_timeout_ms, 300_000);
        assert_eq!(args.log_level, "info");
        assert!(args.output.is_none());
    }

    #[test]
    fn test_invalid_rank_rejected() {
        assert!(Args::try_parse_from(["nccl-rendezvous", "--rank", "-1"]).is_err());
    }
}
