//! 客户端连接器

use std::sync::Arc;

use tracing::info;

use crate::connection::{Connection, ConnectionHandle};
use crate::error::Result;
use crate::registry::PacketRegistry;
use crate::tls::{TlsClientConfig, TlsTransport};
use crate::transport::{FrameTransport, TcpTransport, Transport, TransportConfig};

/// 连接器
///
/// 建立一条出站连接，并在独立任务上运行其分发循环。
#[derive(Clone, Debug)]
pub struct Connector {
    addr: String,
    config: TransportConfig,
}

impl Connector {
    /// # Arguments
    /// * `addr` - 服务器地址，格式为 "host:port"
    /// * `config` - 传输配置，`connect_timeout` 限制建立连接的时间
    pub fn new(addr: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// 建立 TCP 连接
    pub async fn connect(&self, registry: Arc<PacketRegistry>) -> Result<ConnectionHandle> {
        let transport = TcpTransport::connect(&self.addr, &self.config).await?;
        Ok(self.start(transport, registry))
    }

    /// 建立 TLS 连接，握手失败时返回错误
    pub async fn connect_tls(
        &self,
        tls: &TlsClientConfig,
        registry: Arc<PacketRegistry>,
    ) -> Result<ConnectionHandle> {
        let transport = TlsTransport::connect(&self.addr, &self.config, tls).await?;
        Ok(self.start(transport, registry))
    }

    fn start<T: Transport>(&self, transport: T, registry: Arc<PacketRegistry>) -> ConnectionHandle {
        let frames = FrameTransport::from_transport(transport, self.config.buffer_size);
        let connection = Connection::new(frames, registry);
        info!(connection = connection.id(), addr = %self.addr, "Connected to server");
        connection.start()
    }
}
