// The TFTP daemon.

#[cfg(feature = "std")]
use clap::Parser;
#[cfg(feature = "std")]
use smol_tftpd::{
    config::Config,
    server::Server,
    storage::{DirStore, MemStore, Storage},
};
#[cfg(feature = "std")]
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
#[cfg(feature = "std")]
use tracing_subscriber::EnvFilter;

/// Serve files over TFTP.
#[cfg(feature = "std")]
#[derive(Parser, Debug)]
#[command(name = "smol_tftpd", about = "A small TFTP server")]
struct Cli {
    /// Address to listen for requests on.
    #[arg(long, default_value = "0.0.0.0:6969")]
    listen: SocketAddr,

    /// Serve this directory. Files are kept in memory when omitted.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Seconds to wait for each reply before resending.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Sends of one packet before a transfer gives up.
    #[arg(long, default_value_t = 5)]
    max_attempts: u8,
}

#[cfg(feature = "std")]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config {
        timeout: Duration::from_secs(cli.timeout_secs),
        max_attempts: cli.max_attempts,
    };
    let storage: Arc<dyn Storage> = match &cli.root {
        Some(root) => {
            tracing::info!(root = %root.display(), "serving directory");
            Arc::new(DirStore::new(root))
        }
        None => {
            tracing::info!("serving from memory");
            Arc::new(MemStore::new())
        }
    };

    let mut server = Server::bind(cli.listen, storage, config)?;
    server.run()?;
    Ok(())
}

#[cfg(not(feature = "std"))]
fn main() {}
