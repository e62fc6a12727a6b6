//! `igd`-backed gateway implementations.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use igd::aio::{search_gateway, Gateway};
use igd::{GetGenericPortMappingEntryError, PortMappingProtocol, SearchOptions};

use crate::config::{MappingRule, Protocol};
use crate::error::GatewayError;

use super::{mac, GatewayControl, GatewayConnector, GatewaySession, RemoteMappingEntry};

/// How long one multicast gateway search may take.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

impl From<Protocol> for PortMappingProtocol {
    fn from(proto: Protocol) -> Self {
        match proto {
            Protocol::Udp => PortMappingProtocol::UDP,
            Protocol::Tcp => PortMappingProtocol::TCP,
        }
    }
}

impl From<PortMappingProtocol> for Protocol {
    fn from(proto: PortMappingProtocol) -> Self {
        match proto {
            PortMappingProtocol::UDP => Protocol::Udp,
            PortMappingProtocol::TCP => Protocol::Tcp,
        }
    }
}

fn parse_port(port: &str) -> Result<u16, GatewayError> {
    port.parse::<u16>()
        .map_err(|_| GatewayError::InvalidPort(port.to_string()))
}

/// Control handle over one discovered IGD.
pub struct IgdControl {
    gateway: Gateway,
}

#[async_trait]
impl GatewayControl for IgdControl {
    async fn get_entry(&self, index: u32) -> Result<Option<RemoteMappingEntry>, GatewayError> {
        match self.gateway.get_generic_port_mapping_entry(index).await {
            Ok(entry) => Ok(Some(RemoteMappingEntry {
                index,
                eport: entry.external_port.to_string(),
                internal_client: entry.internal_client,
                iport: entry.internal_port.to_string(),
                proto: entry.protocol.into(),
                description: entry.port_mapping_description,
                remote_host: entry.remote_host,
                lease_seconds: entry.lease_duration,
            })),
            // 713 SpecifiedArrayIndexInvalid: we walked past the end.
            Err(GetGenericPortMappingEntryError::SpecifiedArrayIndexInvalid) => Ok(None),
            Err(err) => Err(GatewayError::List(err.to_string())),
        }
    }

    async fn add_mapping(
        &self,
        rule: &MappingRule,
        lan_addr: Ipv4Addr,
        description: &str,
        lease_seconds: u32,
    ) -> Result<(), GatewayError> {
        let eport = parse_port(&rule.eport)?;
        let iport = parse_port(&rule.iport)?;
        self.gateway
            .add_port(
                rule.proto.into(),
                eport,
                SocketAddrV4::new(lan_addr, iport),
                lease_seconds,
                description,
            )
            .await
            .map_err(|err| GatewayError::Add {
                eport: rule.eport.clone(),
                iport: rule.iport.clone(),
                reason: err.to_string(),
            })
    }

    async fn delete_mapping(&self, eport: &str, proto: Protocol) -> Result<(), GatewayError> {
        let port = parse_port(eport)?;
        self.gateway
            .remove_port(proto.into(), port)
            .await
            .map_err(|err| GatewayError::Delete {
                eport: eport.to_string(),
                reason: err.to_string(),
            })
    }
}

/// Multicast discovery of the LAN's IGD.
#[derive(Debug, Clone)]
pub struct IgdConnector {
    search_timeout: Duration,
}

impl Default for IgdConnector {
    fn default() -> Self {
        Self {
            search_timeout: SEARCH_TIMEOUT,
        }
    }
}

impl IgdConnector {
    /// Connector with a custom multicast search timeout.
    pub fn new(search_timeout: Duration) -> Self {
        Self { search_timeout }
    }

    /// Local IPv4 address on the interface the OS routes toward the
    /// gateway. A connected UDP socket is a routing-table lookup only; no
    /// packet is sent.
    async fn lan_addr_towards(gateway: &Gateway) -> Result<Ipv4Addr, GatewayError> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|err| GatewayError::Discovery(err.to_string()))?;
        socket
            .connect(gateway.addr)
            .await
            .map_err(|err| GatewayError::Discovery(err.to_string()))?;
        match socket.local_addr() {
            Ok(addr) => match addr.ip() {
                IpAddr::V4(ip) => Ok(ip),
                IpAddr::V6(_) => Err(GatewayError::Discovery(
                    "route to gateway resolved to an IPv6 address".to_string(),
                )),
            },
            Err(err) => Err(GatewayError::Discovery(err.to_string())),
        }
    }
}

#[async_trait]
impl GatewayConnector for IgdConnector {
    async fn discover(&self) -> Result<(Arc<dyn GatewayControl>, GatewaySession), GatewayError> {
        tracing::info!("searching for UPnP gateway...");
        let gateway = search_gateway(SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        })
        .await
        .map_err(|err| GatewayError::Discovery(err.to_string()))?;
        tracing::info!(addr = %gateway.addr, "UPnP gateway found");

        if let Ok(external_ip) = gateway.get_external_ip().await {
            tracing::info!(%external_ip, "external IP reported by gateway");
        }

        let lan_addr = Self::lan_addr_towards(&gateway).await?;
        let tag = mac::ownership_tag(lan_addr)?;
        tracing::debug!(%lan_addr, %tag, "gateway session established");

        let session = GatewaySession {
            gateway_addr: gateway.addr.to_string(),
            lan_addr,
            tag,
        };
        Ok((Arc::new(IgdControl { gateway }), session))
    }
}
