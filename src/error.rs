//! Error taxonomy for the reconciliation daemon.
//!
//! Every remote-protocol failure is converted to [`GatewayError`] at the
//! gateway boundary; nothing rawer than that reaches the engine or the
//! daemon loop.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Failures of the gateway collaborator (discovery and SOAP actions).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Gateway discovery failed or no IGD answered the search.
    #[error("gateway discovery failed: {0}")]
    Discovery(String),

    /// A `GetGenericPortMappingEntry` call failed for a reason other than
    /// running past the end of the table. Treated as transient by the engine.
    #[error("listing port mappings failed: {0}")]
    List(String),

    /// An `AddPortMapping` call was rejected by the gateway.
    #[error("AddPortMapping({eport}, {iport}) failed: {reason}")]
    Add {
        eport: String,
        iport: String,
        reason: String,
    },

    /// A `DeletePortMapping` call was rejected by the gateway.
    #[error("DeletePortMapping({eport}) failed: {reason}")]
    Delete { eport: String, reason: String },

    /// The LAN-side MAC address backing the ownership tag could not be read.
    #[error("MAC lookup for {ip} failed: {reason}")]
    MacLookup { ip: Ipv4Addr, reason: String },

    /// A mapping rule holds a port string the gateway transport cannot carry.
    #[error("invalid port string {0:?}")]
    InvalidPort(String),
}

/// Failures of one reconciliation pass. Fatal to the call, never to the
/// process.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Reconciliation requested before gateway discovery completed.
    #[error("gateway session is not initialized yet")]
    NotInitialized,

    /// The transient-error budget for one table index was exceeded during
    /// enumeration. No add or delete was issued.
    #[error("listing port mappings gave up at index {index} after {retries} retries")]
    RetryExhausted { index: u32, retries: u32 },

    /// A desired external port is already held by an entry we do not own.
    /// Nothing was mutated.
    #[error("external port {eport} is already in use by another device")]
    PortConflict { eport: String },

    /// The add phase failed. Mappings removed earlier in the pass are not
    /// restored and rules after the failing one were not attempted.
    #[error("failed to apply mapping for external port {eport}")]
    ApplyFailed {
        eport: String,
        #[source]
        source: GatewayError,
    },

    /// Any other gateway failure surfaced through the engine.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Failures of the persisted-configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed.
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but is not valid JSON for a desired configuration.
    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A rule in the file or request failed validation.
    #[error("invalid mapping rule: {0}")]
    InvalidRule(String),
}

/// Result alias for reconciliation operations.
pub type SyncResult<T> = Result<T, SyncError>;
