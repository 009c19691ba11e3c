//! Bridge configuration.
//!
//! Every value has a built-in default matching the enclave network layout
//! the host proxy expects, so the daemon runs without a config file. A TOML
//! file may override individual fields:
//!
//! ```toml
//! retry_interval_secs = 1
//! resolver_path = "/run/resolvconf/resolv.conf"
//!
//! [transport]
//! cid = 3
//! port = 1024
//! path = "/connect"
//!
//! [interface]
//! name = "tap0"
//! mac = "ba:aa:ad:c0:ff:ee"
//! address = "192.168.127.2/24"
//! gateway = "192.168.127.1"
//! mtu = 1500
//! ```

use crate::error::{BridgeError, BridgeResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// CID of the parent instance (the host side of the enclave).
pub const DEFAULT_PARENT_CID: u32 = 3;

/// vsock port the host proxy listens on.
pub const DEFAULT_HOST_PROXY_PORT: u32 = 1024;

/// Request path announced to the host proxy.
pub const DEFAULT_CONNECT_PATH: &str = "/connect";

/// TAP interface name.
pub const DEFAULT_TAP_NAME: &str = "tap0";

/// Hardware address assigned to the TAP interface.
pub const DEFAULT_MAC: MacAddr = MacAddr([0xba, 0xaa, 0xad, 0xc0, 0xff, 0xee]);

/// Address and prefix assigned to the TAP interface.
pub const DEFAULT_TAP_ADDRESS: &str = "192.168.127.2/24";

/// Default gateway; the host proxy also serves DNS on this address.
pub const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 1);

/// Link MTU.
pub const DEFAULT_MTU: u16 = 1500;

/// Resolver file. `/etc/resolv.conf` in the enclave image links here.
pub const DEFAULT_RESOLVER_PATH: &str = "/run/resolvconf/resolv.conf";

/// Delay between session attempts.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 1;

/// Smallest MTU accepted by `validate()` (IPv4 minimum datagram size).
const MIN_MTU: u16 = 576;

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| BridgeError::config(format!("Invalid MAC address: {}", s)))?;
            if part.len() != 2 {
                return Err(BridgeError::config(format!("Invalid MAC address: {}", s)));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|e| {
                BridgeError::config_with_source(format!("Invalid MAC address: {}", s), e)
            })?;
        }
        if parts.next().is_some() {
            return Err(BridgeError::config(format!("Invalid MAC address: {}", s)));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where the host proxy is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Context ID of the host.
    pub cid: u32,
    /// vsock port of the host proxy.
    pub port: u32,
    /// Path of the announce request.
    pub path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            cid: DEFAULT_PARENT_CID,
            port: DEFAULT_HOST_PROXY_PORT,
            path: DEFAULT_CONNECT_PATH.to_string(),
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vsock://{}:{}{}", self.cid, self.port, self.path)
    }
}

/// Local TAP interface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceConfig {
    /// Interface name.
    pub name: String,
    /// Hardware address.
    pub mac: MacAddr,
    /// Address with prefix length.
    pub address: Ipv4Net,
    /// Default gateway and nameserver.
    pub gateway: Ipv4Addr,
    /// Link MTU.
    pub mtu: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_TAP_NAME.to_string(),
            mac: DEFAULT_MAC,
            address: default_tap_address(),
            gateway: DEFAULT_GATEWAY,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Complete bridge configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Host proxy endpoint.
    pub transport: TransportConfig,
    /// TAP interface.
    pub interface: InterfaceConfig,
    /// Resolver configuration file to write.
    pub resolver_path: PathBuf,
    /// Seconds to wait between session attempts.
    pub retry_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            interface: InterfaceConfig::default(),
            resolver_path: PathBuf::from(DEFAULT_RESOLVER_PATH),
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> BridgeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BridgeError::config_with_source("Failed to parse config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config_with_source(
                format!("Failed to read config file: {}", path.display()),
                e,
            )
        })?;
        Self::from_toml_str(&content)
    }

    /// Delay between session attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Check values that would otherwise fail on every session attempt.
    pub fn validate(&self) -> BridgeResult<()> {
        let iface = &self.interface;

        if iface.name.is_empty() || iface.name.len() > 15 {
            return Err(BridgeError::config(format!(
                "Invalid interface name '{}': must be 1-15 characters",
                iface.name
            )));
        }
        if iface.mtu < MIN_MTU {
            return Err(BridgeError::config(format!(
                "Invalid MTU {}: must be at least {}",
                iface.mtu, MIN_MTU
            )));
        }
        if !iface.address.contains(&iface.gateway) {
            return Err(BridgeError::config(format!(
                "Gateway {} is outside interface network {}",
                iface.gateway,
                iface.address.trunc()
            )));
        }
        if iface.address.addr() == iface.gateway {
            return Err(BridgeError::config(format!(
                "Interface address {} must differ from gateway",
                iface.address.addr()
            )));
        }
        if !self.transport.path.starts_with('/') {
            return Err(BridgeError::config(format!(
                "Invalid request path '{}': must start with '/'",
                self.transport.path
            )));
        }
        if self.retry_interval_secs == 0 {
            return Err(BridgeError::config("retry_interval_secs must be non-zero"));
        }
        Ok(())
    }
}

fn default_tap_address() -> Ipv4Net {
    DEFAULT_TAP_ADDRESS.parse().unwrap()
}
