//! Desired port-mapping configuration and its JSON persistence.
//!
//! The operator's intent is a [`DesiredConfig`]: an enable flag plus an
//! ordered list of [`MappingRule`]s. It is replaced wholesale on every
//! successful reconciliation and persisted strictly after a successful
//! apply, never before.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum characters in a port string (the gateway carries ports as
/// 5-digit decimal fields).
const MAX_PORT_DIGITS: usize = 5;

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// User Datagram Protocol.
    Udp,
    /// Transmission Control Protocol.
    Tcp,
}

impl Protocol {
    /// Wire string used by both the request envelope and the gateway.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One desired forwarding rule: external port, internal port, protocol.
///
/// Ports stay in their wire form (decimal strings) end to end; they are
/// validated to parse as 16-bit port numbers before any gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    /// External port on the gateway's WAN side.
    pub eport: String,
    /// Internal port on this host.
    pub iport: String,
    /// Protocol to forward.
    pub proto: Protocol,
}

impl MappingRule {
    /// Check both port strings: non-empty, at most five digits, and a
    /// valid 16-bit port number.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port(&self.eport)?;
        validate_port(&self.iport)?;
        Ok(())
    }
}

fn validate_port(port: &str) -> Result<(), ConfigError> {
    if port.is_empty() || port.len() > MAX_PORT_DIGITS {
        return Err(ConfigError::InvalidRule(format!(
            "port {port:?} must be 1 to {MAX_PORT_DIGITS} digits"
        )));
    }
    if port.parse::<u16>().is_err() {
        return Err(ConfigError::InvalidRule(format!(
            "port {port:?} is not a valid port number"
        )));
    }
    Ok(())
}

/// The operator's desired state for the gateway's forwarding table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredConfig {
    /// Whether port forwarding should be active at all.
    pub enable: bool,
    /// Rules to hold on the gateway while enabled.
    #[serde(default)]
    pub rules: Vec<MappingRule>,
}

impl Default for DesiredConfig {
    fn default() -> Self {
        Self {
            enable: false,
            rules: Vec::new(),
        }
    }
}

impl DesiredConfig {
    /// Validate every rule in the set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// JSON file persistence for [`DesiredConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted configuration. A missing file is not an error:
    /// a default (disabled, no rules) file is created and returned.
    pub fn load(&self) -> Result<DesiredConfig, ConfigError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no config file, creating default");
                let cfg = DesiredConfig::default();
                self.save(&cfg)?;
                return Ok(cfg);
            }
            Err(err) => return Err(err.into()),
        };
        let cfg: DesiredConfig = serde_json::from_slice(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write `cfg` out as pretty-printed JSON.
    pub fn save(&self, cfg: &DesiredConfig) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(cfg)?;
        fs::write(&self.path, raw + "\n")?;
        tracing::debug!(path = %self.path.display(), enable = cfg.enable, rules = cfg.rules.len(), "config persisted");
        Ok(())
    }
}
