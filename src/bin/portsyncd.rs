use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use portsyncd::{
    init_logging, ConfigStore, Daemon, DaemonConfig, IgdConnector, UnixDatagramTransport,
    DEFAULT_LEASE_SECONDS, VERSION,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "UPnP port-forwarding synchronization daemon", long_about = None)]
struct Args {
    /// Path of the persisted desired-configuration file
    #[arg(short, long, default_value = "portsyncd_cfg.json")]
    config: PathBuf,

    /// Path of the request socket
    #[arg(short, long, default_value = "/tmp/portsyncd.sock")]
    socket: PathBuf,

    /// Lease duration requested for every mapping, in seconds
    #[arg(long, default_value_t = DEFAULT_LEASE_SECONDS)]
    lease: u32,

    /// Gateway discovery timeout, in seconds
    #[arg(long, default_value_t = 5)]
    discovery_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);
    tracing::info!(version = VERSION, "portsyncd starting");

    let store = ConfigStore::new(&args.config);
    let transport = UnixDatagramTransport::bind(&args.socket)?;
    let connector = Arc::new(IgdConnector::new(Duration::from_secs(
        args.discovery_timeout,
    )));

    let cfg = DaemonConfig {
        lease_seconds: args.lease,
        ..DaemonConfig::default()
    };

    Daemon::new(connector, transport, store, cfg).run().await
}
