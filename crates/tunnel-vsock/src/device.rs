//! TAP device creation and interface configuration.
//!
//! The bridge works at layer 2: the host proxy runs its own userspace
//! network stack and expects whole Ethernet frames, so the local interface
//! is a TAP device rather than a TUN device. Addressing is static; there is
//! no DHCP client in the enclave.

use crate::config::InterfaceConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::resolver;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::process::Command;
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter, Layer};

/// A TAP device with async I/O.
///
/// Every read returns exactly one Ethernet frame and every write must carry
/// exactly one frame.
pub struct TapDevice {
    device: AsyncDevice,
    name: String,
}

impl TapDevice {
    /// Create the TAP device named in `config`.
    ///
    /// The link is left down and unaddressed; see [`InterfaceConfigurator`].
    pub fn create(config: &InterfaceConfig) -> BridgeResult<Self> {
        let mut tun_config = Configuration::default();
        tun_config.tun_name(&config.name).layer(Layer::L2);

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config).map_err(|e| {
            BridgeError::device_create_with_source(
                format!("Failed to create TAP device {}", config.name),
                e,
            )
        })?;

        let name = device.tun_name().map_err(|e| {
            BridgeError::device_create_with_source("Failed to get TAP device name", e)
        })?;

        log::info!("Created TAP device: {}", name);

        Ok(Self { device, name })
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split the device into read and write halves.
    /// Note: The tun crate returns (writer, reader) order from split().
    pub fn split(self) -> BridgeResult<(DeviceReader, DeviceWriter)> {
        let (writer, reader) = self.device.split().map_err(|e| {
            BridgeError::device_create_with_source("Failed to split TAP device", e)
        })?;
        Ok((reader, writer))
    }
}

/// Prepares the local interface before any frame is forwarded.
///
/// Both operations run once per session, after the device exists. Errors are
/// reported as [`BridgeError::Config`] and end that session attempt.
pub trait InterfaceConfigurator: Send + Sync {
    /// Assign hardware address, MTU, address and default route, and bring the link up.
    fn configure(&self, iface: &InterfaceConfig) -> impl Future<Output = BridgeResult<()>> + Send;

    /// Point the system resolver at `nameserver`.
    fn write_resolver_config(
        &self,
        nameserver: Ipv4Addr,
    ) -> impl Future<Output = BridgeResult<()>> + Send;
}

/// Configures the interface with iproute2 and writes a resolver file.
#[derive(Debug, Clone)]
pub struct IpCommandConfigurator {
    resolver_path: PathBuf,
}

impl IpCommandConfigurator {
    /// Create a configurator that writes the resolver file to `resolver_path`.
    pub fn new(resolver_path: impl Into<PathBuf>) -> Self {
        Self {
            resolver_path: resolver_path.into(),
        }
    }
}

impl InterfaceConfigurator for IpCommandConfigurator {
    async fn configure(&self, iface: &InterfaceConfig) -> BridgeResult<()> {
        for args in configure_commands(iface) {
            run_ip(&args).await?;
        }
        log::info!(
            "Configured {}: mac {}, address {}, mtu {}, gateway {}",
            iface.name,
            iface.mac,
            iface.address,
            iface.mtu,
            iface.gateway
        );
        Ok(())
    }

    async fn write_resolver_config(&self, nameserver: Ipv4Addr) -> BridgeResult<()> {
        resolver::write_resolver_config(&self.resolver_path, nameserver).await
    }
}

/// `ip` invocations that bring `iface` into its configured state.
///
/// The hardware address and MTU are set while the link is still down.
/// Every step is safe to repeat: addresses that already exist are accepted
/// and the default route is replaced rather than added.
pub fn configure_commands(iface: &InterfaceConfig) -> Vec<Vec<String>> {
    let name = iface.name.as_str();
    vec![
        vec![
            "link".into(),
            "set".into(),
            "dev".into(),
            name.into(),
            "address".into(),
            iface.mac.to_string(),
        ],
        vec![
            "link".into(),
            "set".into(),
            "dev".into(),
            name.into(),
            "mtu".into(),
            iface.mtu.to_string(),
        ],
        vec![
            "addr".into(),
            "add".into(),
            iface.address.to_string(),
            "dev".into(),
            name.into(),
        ],
        vec![
            "link".into(),
            "set".into(),
            "dev".into(),
            name.into(),
            "up".into(),
        ],
        vec![
            "route".into(),
            "replace".into(),
            "default".into(),
            "via".into(),
            iface.gateway.to_string(),
            "dev".into(),
            name.into(),
        ],
    ]
}

/// Check if an error message indicates that a resource already exists.
///
/// Linux iproute2 answers "RTNETLINK answers: File exists".
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

/// Run one `ip` command, treating "already exists" as success.
async fn run_ip(args: &[String]) -> BridgeResult<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| BridgeError::config_with_source("Failed to execute ip command", e))?;

    if output.status.success() {
        log::debug!("ip {}", args.join(" "));
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_trimmed = stderr.trim();
    if is_already_exists_error(stderr_trimmed) {
        log::warn!(
            "ip {}: already exists (treating as success): {}",
            args.join(" "),
            stderr_trimmed
        );
        return Ok(());
    }

    Err(BridgeError::config(format!(
        "ip {} failed: {}",
        args.join(" "),
        stderr_trimmed
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(iface: &InterfaceConfig) -> Vec<String> {
        configure_commands(iface)
            .into_iter()
            .map(|args| args.join(" "))
            .collect()
    }

    #[test]
    fn test_configure_commands_default_layout() {
        let commands = joined(&InterfaceConfig::default());
        assert_eq!(
            commands,
            vec![
                "link set dev tap0 address ba:aa:ad:c0:ff:ee",
                "link set dev tap0 mtu 1500",
                "addr add 192.168.127.2/24 dev tap0",
                "link set dev tap0 up",
                "route replace default via 192.168.127.1 dev tap0",
            ]
        );
    }

    #[test]
    fn test_link_up_after_mac_and_mtu() {
        let commands = joined(&InterfaceConfig::default());
        let up = commands.iter().position(|c| c.ends_with(" up")).unwrap();
        let mac = commands.iter().position(|c| c.contains(" address ")).unwrap();
        let mtu = commands.iter().position(|c| c.contains(" mtu ")).unwrap();
        assert!(mac < up && mtu < up);
        assert!(commands.last().unwrap().starts_with("route "));
    }

    #[test]
    fn test_configure_commands_custom_interface() {
        let iface = InterfaceConfig {
            name: "tap7".into(),
            mac: "02:00:00:00:00:07".parse().unwrap(),
            address: "10.1.2.3/16".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 1, 0, 1),
            mtu: 9000,
        };
        let commands = joined(&iface);
        assert!(commands.contains(&"link set dev tap7 address 02:00:00:00:00:07".to_string()));
        assert!(commands.contains(&"link set dev tap7 mtu 9000".to_string()));
        assert!(commands.contains(&"addr add 10.1.2.3/16 dev tap7".to_string()));
        assert!(commands.contains(&"route replace default via 10.1.0.1 dev tap7".to_string()));
    }

    #[test]
    fn test_is_already_exists_error() {
        assert!(is_already_exists_error("RTNETLINK answers: File exists"));
        assert!(is_already_exists_error("error: EEXIST"));
        assert!(!is_already_exists_error("Cannot find device \"tap0\""));
    }
}
