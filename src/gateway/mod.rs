//! Gateway collaborator seam.
//!
//! The daemon never speaks SOAP itself; it consumes an opaque
//! [`GatewayControl`] capability discovered through a [`GatewayConnector`].
//! The production implementations wrap the `igd` crate; tests substitute
//! in-memory fakes.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{MappingRule, Protocol};
use crate::error::GatewayError;

pub mod igd;
pub mod mac;

pub use self::igd::IgdConnector;

/// One row of the gateway's forwarding table, captured during enumeration.
/// Lives only within a single reconciliation pass.
#[derive(Debug, Clone)]
pub struct RemoteMappingEntry {
    /// Position in the gateway's table at capture time.
    pub index: u32,
    /// External port, decimal string.
    pub eport: String,
    /// LAN client the mapping points at.
    pub internal_client: String,
    /// Internal port, decimal string.
    pub iport: String,
    /// Protocol of the mapping.
    pub proto: Protocol,
    /// Free-form description; our ownership tag for entries we created.
    pub description: String,
    /// Remote-host filter, usually empty (any host).
    pub remote_host: String,
    /// Remaining lease in seconds, 0 meaning permanent.
    pub lease_seconds: u32,
}

/// An established gateway session: where the gateway is, which LAN address
/// we present, and the tag that marks mappings as ours.
///
/// Owned by the lifecycle controller and handed to the engine by reference;
/// the tag is fixed for the process lifetime once discovery succeeds.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    /// Gateway control endpoint, for logging.
    pub gateway_addr: String,
    /// Our IPv4 address on the LAN interface that reaches the gateway.
    pub lan_addr: Ipv4Addr,
    /// Ownership tag written as the description of every mapping we create.
    pub tag: String,
}

/// Remote operations on a discovered gateway.
#[async_trait]
pub trait GatewayControl: Send + Sync {
    /// Read the table entry at `index`. `Ok(None)` is the well-defined
    /// out-of-range answer that ends enumeration; every `Err` is transient.
    async fn get_entry(&self, index: u32) -> Result<Option<RemoteMappingEntry>, GatewayError>;

    /// Create (or refresh) a mapping for `rule` pointing at `lan_addr`,
    /// described by `description`, leased for `lease_seconds`.
    async fn add_mapping(
        &self,
        rule: &MappingRule,
        lan_addr: Ipv4Addr,
        description: &str,
        lease_seconds: u32,
    ) -> Result<(), GatewayError>;

    /// Delete the mapping at `eport`/`proto`.
    async fn delete_mapping(&self, eport: &str, proto: Protocol) -> Result<(), GatewayError>;
}

/// Discovery of a gateway, producing a control handle plus the session
/// identity derived from it.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Search for a gateway and establish a session with it.
    async fn discover(&self) -> Result<(Arc<dyn GatewayControl>, GatewaySession), GatewayError>;
}
