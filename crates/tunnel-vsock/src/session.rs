//! Session resources: the transport and device halves one session owns.
//!
//! A [`SessionBackend`] produces them. The supervisor only sees boxed
//! async I/O halves, so it can be driven by in-memory streams in tests.

use crate::config::BridgeConfig;
use crate::device::{InterfaceConfigurator, IpCommandConfigurator, TapDevice};
use crate::error::BridgeResult;
use crate::transport;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Both halves of an announced transport connection.
pub struct TransportHalves {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

/// Both halves of a configured device.
pub struct DeviceHalves {
    pub name: String,
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

/// Source of fresh session resources.
///
/// Every call hands out new resources; nothing is reused across retries.
/// Dropping the returned halves closes them.
pub trait SessionBackend: Send + Sync {
    /// Connect to the host proxy and announce the tunnel.
    fn establish(&self) -> impl Future<Output = BridgeResult<TransportHalves>> + Send;

    /// Create the local device, configure it and point the resolver at the gateway.
    fn prepare_device(&self) -> impl Future<Output = BridgeResult<DeviceHalves>> + Send;
}

/// vsock transport plus TAP device, the production backend.
pub struct VsockTapBackend<C = IpCommandConfigurator> {
    config: Arc<BridgeConfig>,
    configurator: C,
}

impl VsockTapBackend<IpCommandConfigurator> {
    /// Backend that configures the interface with `ip` commands.
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        let configurator = IpCommandConfigurator::new(config.resolver_path.clone());
        Self {
            config,
            configurator,
        }
    }
}

impl<C: InterfaceConfigurator> SessionBackend for VsockTapBackend<C> {
    async fn establish(&self) -> BridgeResult<TransportHalves> {
        let mut stream = transport::connect(&self.config.transport).await?;
        transport::announce(&mut stream, &self.config.transport).await?;
        let (reader, writer) = tokio::io::split(stream);

        Ok(TransportHalves {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn prepare_device(&self) -> BridgeResult<DeviceHalves> {
        let iface = &self.config.interface;
        let device = TapDevice::create(iface)?;
        let name = device.name().to_string();

        // On failure `device` is dropped here, which closes it.
        self.configurator.configure(iface).await?;
        self.configurator
            .write_resolver_config(iface.gateway)
            .await?;

        let (reader, writer) = device.split()?;
        Ok(DeviceHalves {
            name,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[tokio::test]
    async fn test_establish_unreachable_proxy_is_connect_error() {
        let mut config = BridgeConfig::default();
        config.transport.cid = 0;
        config.transport.port = 1;
        let backend = VsockTapBackend::new(Arc::new(config));

        match backend.establish().await {
            Err(BridgeError::Connect(_)) => {}
            Err(other) => panic!("expected Connect error, got {:?}", other),
            Ok(_) => panic!("expected Connect error, got a connection"),
        }
    }
}
