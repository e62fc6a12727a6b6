//! Ownership tag derivation.
//!
//! Every mapping this daemon creates carries the MAC address of the LAN
//! interface that reaches the gateway as its description. The tag is the
//! sole criterion for recognizing our own entries later, so it must be
//! stable across restarts of the process on the same host.

use std::net::{IpAddr, Ipv4Addr};

use crate::error::GatewayError;

/// Derive the ownership tag for the interface holding `lan_addr`:
/// 12 lowercase hex characters, no separators.
pub fn ownership_tag(lan_addr: Ipv4Addr) -> Result<String, GatewayError> {
    let interfaces = if_addrs::get_if_addrs().map_err(|err| GatewayError::MacLookup {
        ip: lan_addr,
        reason: err.to_string(),
    })?;
    let iface = interfaces
        .into_iter()
        .find(|iface| iface.ip() == IpAddr::V4(lan_addr))
        .ok_or_else(|| GatewayError::MacLookup {
            ip: lan_addr,
            reason: "no interface holds this address".to_string(),
        })?;

    let mac = mac_address::mac_address_by_name(&iface.name)
        .map_err(|err| GatewayError::MacLookup {
            ip: lan_addr,
            reason: err.to_string(),
        })?
        .ok_or_else(|| GatewayError::MacLookup {
            ip: lan_addr,
            reason: format!("interface {} has no hardware address", iface.name),
        })?;

    Ok(format_tag(&mac.bytes()))
}

fn format_tag(bytes: &[u8; 6]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
