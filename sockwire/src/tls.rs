//! TLS 传输实现
//!
//! 服务端使用 PEM 证书链 + 私钥，客户端使用 PEM 信任锚。
//! 握手在任何包通信之前完成。

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::transport::{TcpListener, TcpTransport, Transport, TransportConfig, TransportListener};

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::Tls(format!("Failed to open {}: {e}", path.display())))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::Tls(format!("Failed to parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ProtocolError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProtocolError::Tls(format!("Failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| ProtocolError::Tls(format!("No private key found in {}", path.display())))
}

/// TLS 服务端配置（密钥材料）
#[derive(Clone, Debug)]
pub struct TlsServerConfig {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsServerConfig {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// 读取证书和私钥，构造 rustls 服务端配置
    pub fn load(&self) -> Result<Arc<ServerConfig>> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }
}

/// TLS 客户端配置（信任材料）
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    ca_path: PathBuf,
    server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new(ca_path: impl AsRef<Path>) -> Self {
        Self {
            ca_path: ca_path.as_ref().to_path_buf(),
            server_name: None,
        }
    }

    /// 指定证书校验使用的服务器名，默认取连接地址的主机部分
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// 读取信任锚，构造 rustls 客户端配置
    pub fn load(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_path)? {
            roots.add(cert)?;
        }

        let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    /// 证书校验使用的服务器名
    pub fn server_name(&self, addr: &str) -> Result<ServerName<'static>> {
        let host = match &self.server_name {
            Some(name) => name.clone(),
            None => host_part(addr).to_string(),
        };
        ServerName::try_from(host)
            .map_err(|e| ProtocolError::Tls(format!("Invalid server name: {e}")))
    }
}

/// "host:port" 的主机部分，支持 "[::1]:port"
fn host_part(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// TLS 传输实现
pub struct TlsTransport {
    stream: TlsStream<TcpStream>,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    /// 建立 TCP 连接并完成 TLS 握手（客户端使用）
    ///
    /// 握手失败时返回错误，不会建立连接。
    pub async fn connect(
        addr: &str,
        config: &TransportConfig,
        tls: &TlsClientConfig,
    ) -> Result<Self> {
        let connector = TlsConnector::from(tls.load()?);
        let server_name = tls.server_name(addr)?;

        let tcp = TcpTransport::connect(addr, config).await?;
        let peer_addr = tcp.peer_addr();
        let stream = connector
            .connect(server_name, tcp.into_stream())
            .await
            .map_err(|e| ProtocolError::Tls(format!("TLS handshake failed: {e}")))?;

        debug!(peer = ?peer_addr, "TLS handshake complete");
        Ok(Self {
            stream: TlsStream::from(stream),
            peer_addr,
        })
    }
}

impl Transport for TlsTransport {
    type Reader = ReadHalf<TlsStream<TcpStream>>;
    type Writer = WriteHalf<TlsStream<TcpStream>>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.stream)
    }
}

/// TLS 监听器实现
///
/// `accept` 只接受 TCP 连接，握手推迟到该连接自己的任务上，
/// 单个客户端握手失败不影响监听器。
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// 绑定地址并开始监听
    pub async fn bind(addr: &str, config: &TransportConfig, tls: &TlsServerConfig) -> Result<Self> {
        let acceptor = TlsAcceptor::from(tls.load()?);
        let inner = TcpListener::bind(addr, config).await?;
        Ok(Self { inner, acceptor })
    }
}

impl TransportListener for TlsListener {
    type Transport = TlsTransport;
    type Handshake = BoxFuture<'static, Result<TlsTransport>>;

    async fn accept(&self) -> Result<Self::Handshake> {
        let (stream, peer) = self.inner.accept_stream().await?;
        debug!(%peer, "Accepted TCP stream, TLS handshake pending");

        let acceptor = self.acceptor.clone();
        let config = self.inner.config().clone();
        let handshake: Self::Handshake = Box::pin(async move {
            let tcp = TcpTransport::from_stream(stream, &config)?.into_stream();
            let stream = acceptor
                .accept(tcp)
                .await
                .map_err(|e| ProtocolError::Tls(format!("TLS handshake failed: {e}")))?;
            Ok(TlsTransport {
                stream: TlsStream::from(stream),
                peer_addr: Some(peer),
            })
        });
        Ok(handshake)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}
