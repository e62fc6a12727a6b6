//! portsyncd library (lib.rs)
//!
//! Keeps a router's UPnP-managed NAT port-forwarding table synchronized
//! with an operator-supplied desired configuration: discover the gateway,
//! enumerate its mapping table, recognize our own entries by ownership
//! tag, diff against the desired rule set, and apply additions/removals
//! with bounded retry. Driven by inter-process update requests and a
//! recurring lease-renewal timer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod sync;

// Re-export main types
pub use config::{ConfigStore, DesiredConfig, MappingRule, Protocol};
pub use daemon::{Daemon, DaemonConfig, DaemonState, DEFAULT_LEASE_SECONDS};
pub use error::{ConfigError, GatewayError, SyncError, SyncResult};
pub use gateway::{
    GatewayConnector, GatewayControl, GatewaySession, IgdConnector, RemoteMappingEntry,
};
pub use ipc::{RequestTransport, UnixDatagramTransport};
pub use sync::{SyncEngine, SyncOutcome, MAX_RETRY_ON_ERR};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
        // Reduce verbosity of some dependencies
        .add_directive("igd=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("runtime=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(filter)
        .init();
}
