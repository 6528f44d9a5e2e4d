//! 传输层抽象
//!
//! `Transport` / `TransportListener` 使连接层与具体传输（TCP、TLS）解耦；
//! `FrameTransport` 在一条双工字节流上提供带缓冲的类型化读写。

use std::future::{ready, Future, Ready};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::{CONNECT_TIMEOUT, DEFAULT_BUFFER_SIZE, LISTEN_BACKLOG};

/// 传输层配置
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 读写缓冲区及套接字收发缓冲区大小
    pub buffer_size: usize,
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 是否禁用 Nagle 算法（TCP nodelay）
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true, // 每次写入都立即 flush，配合 nodelay 减少延迟
        }
    }
}

impl TransportConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// 传输层抽象 trait
///
/// 一条已建立的双工字节流，可分离为独立的读取端和写入端。
pub trait Transport: Send + Sized + 'static {
    /// 读取端类型
    type Reader: AsyncRead + Unpin + Send + 'static;
    /// 写入端类型
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// 对端地址
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// 分离读写端
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// 传输层监听器抽象 trait（服务端使用）
pub trait TransportListener: Send + Sync + Sized + 'static {
    /// 对应的传输类型
    type Transport: Transport;
    /// 单条连接的建立过程（TLS 握手），在该连接自己的任务上完成
    type Handshake: Future<Output = Result<Self::Transport>> + Send + 'static;

    /// 接受新的原始连接
    ///
    /// 返回错误表示监听器本身失效。
    fn accept(&self) -> impl Future<Output = Result<Self::Handshake>> + Send;

    /// 本地绑定地址
    fn local_addr(&self) -> Result<SocketAddr>;
}

// ============================================================================
// 帧传输
// ============================================================================

/// 共享写入端
///
/// 连接的分发循环与外部代码（例如客户端主动发送）共用同一个写入端，
/// 每个包在持锁期间完整写出，不会与其他发送交错。
#[derive(Clone)]
pub struct PacketSender {
    writer: Arc<Mutex<FrameWriter>>,
}

impl PacketSender {
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// 编码并发送一个包
    pub async fn send<P: Packet>(&self, packet: &P) -> Result<()> {
        self.writer.lock().await.write_packet(packet).await
    }

    /// 独占写入端，用于逐字段写入
    pub async fn lock(&self) -> MutexGuard<'_, FrameWriter> {
        self.writer.lock().await
    }

    /// 关闭写入端
    pub async fn close(&self) -> Result<()> {
        self.writer.lock().await.close().await
    }
}

impl std::fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSender").finish_non_exhaustive()
    }
}

/// 帧传输
///
/// 每条连接独占一个实例：读取端只由分发循环使用，写入端经
/// [`PacketSender`] 共享。
pub struct FrameTransport {
    reader: FrameReader,
    sender: PacketSender,
    peer_addr: Option<SocketAddr>,
    closed: bool,
}

impl FrameTransport {
    /// 从读写端直接创建
    pub fn new<R, W>(reader: R, writer: W, buffer_size: usize, peer_addr: Option<SocketAddr>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader::new(reader, buffer_size),
            sender: PacketSender::new(FrameWriter::new(writer, buffer_size)),
            peer_addr,
            closed: false,
        }
    }

    /// 从传输层创建
    pub fn from_transport<T: Transport>(transport: T, buffer_size: usize) -> Self {
        let peer_addr = transport.peer_addr();
        let (reader, writer) = transport.split();
        Self::new(reader, writer, buffer_size, peer_addr)
    }

    pub fn reader(&mut self) -> &mut FrameReader {
        &mut self.reader
    }

    /// 独占写入端
    pub async fn writer(&mut self) -> MutexGuard<'_, FrameWriter> {
        self.sender.lock().await
    }

    /// 编码、写出并 flush 一个包
    pub async fn write_packet<P: Packet>(&mut self, packet: &P) -> Result<()> {
        self.sender.send(packet).await
    }

    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 关闭传输，仅第一次调用生效
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sender.close().await
    }
}

impl std::fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTransport")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// TCP 实现
// ============================================================================

/// 解析 "host:port" 为第一个可用地址
pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .map_err(|e| ProtocolError::InvalidAddress(format!("{addr}: {e}")))?
        .next()
        .ok_or_else(|| ProtocolError::InvalidAddress(addr.to_string()))
}

/// 带超时的连接，超时返回 [`ProtocolError::ConnectionTimeout`]
async fn connect_within<T, F>(limit: Duration, connect: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    timeout(limit, connect)
        .await
        .map_err(|_| ProtocolError::ConnectionTimeout)?
        .map_err(ProtocolError::Io)
}

fn socket_buffer_size(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

/// TCP 传输实现
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// 建立连接（客户端使用）
    ///
    /// # Arguments
    /// * `addr` - 服务器地址，格式为 "host:port"
    /// * `config` - 传输配置
    pub async fn connect(addr: &str, config: &TransportConfig) -> Result<Self> {
        let target = resolve(addr).await?;
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let size = socket_buffer_size(config.buffer_size);
        socket.set_send_buffer_size(size)?;
        socket.set_recv_buffer_size(size)?;

        let stream = connect_within(config.connect_timeout, socket.connect(target)).await?;

        stream.set_nodelay(config.nodelay)?;

        Ok(Self {
            stream,
            peer_addr: Some(target),
        })
    }

    /// 从已有的 TcpStream 创建（服务端 accept 后使用）
    pub fn from_stream(stream: TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_nodelay(config.nodelay)?;
        let socket = SockRef::from(&stream);
        socket.set_recv_buffer_size(config.buffer_size)?;
        socket.set_send_buffer_size(config.buffer_size)?;

        let peer_addr = stream.peer_addr().ok();
        Ok(Self { stream, peer_addr })
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.stream.into_split()
    }
}

/// TCP 监听器实现
pub struct TcpListener {
    listener: tokio::net::TcpListener,
    config: TransportConfig,
}

impl TcpListener {
    /// 绑定地址并开始监听，接收缓冲区按 `config.buffer_size` 设置
    pub async fn bind(addr: &str, config: &TransportConfig) -> Result<Self> {
        let local = resolve(addr).await?;

        let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(config.buffer_size)?;
        socket.bind(&local.into())?;
        socket.listen(LISTEN_BACKLOG as i32)?;
        socket.set_nonblocking(true)?;

        let listener = tokio::net::TcpListener::from_std(socket.into())?;
        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    /// 接受一条 TCP 连接，返回流和对端地址
    pub async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl TransportListener for TcpListener {
    type Transport = TcpTransport;
    type Handshake = Ready<Result<TcpTransport>>;

    async fn accept(&self) -> Result<Self::Handshake> {
        let (stream, peer) = self.accept_stream().await?;
        debug!(%peer, "Accepted TCP stream");
        Ok(ready(TcpTransport::from_stream(stream, &self.config)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RawPacket;

    #[tokio::test]
    async fn test_tcp_listener_bind() {
        let listener = TcpListener::bind("127.0.0.1:0", &TransportConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let result = TcpListener::bind("not an address", &TransportConfig::default()).await;
        assert!(matches!(result, Err(ProtocolError::InvalidAddress(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let pending = std::future::pending::<std::io::Result<TcpStream>>();
        let result = connect_within(Duration::from_millis(50), pending).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionTimeout)));
    }

    #[tokio::test]
    async fn test_connect_error_passes_through() {
        let refused =
            async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)) };
        let result = connect_within(Duration::from_secs(1), refused).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_tcp_connect_and_accept() {
        let config = TransportConfig::default().with_buffer_size(8192);
        let listener = TcpListener::bind("127.0.0.1:0", &config).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_handle = tokio::spawn(async move {
            let config = TransportConfig::default();
            TcpTransport::connect(&addr.to_string(), &config).await
        });

        let handshake = listener.accept().await.unwrap();
        let server_transport = handshake.await.unwrap();
        let client_transport = client_handle.await.unwrap().unwrap();

        assert_eq!(client_transport.peer_addr(), Some(addr));
        assert!(server_transport.peer_addr().is_some());
        assert!(format!("{:?}", server_transport).contains("TcpTransport"));
    }

    #[tokio::test]
    async fn test_frame_transport_over_tcp() {
        let config = TransportConfig::default();
        let listener = TcpListener::bind("127.0.0.1:0", &config).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let transport = TcpTransport::connect(&addr.to_string(), &TransportConfig::default())
                .await
                .unwrap();
            let mut frames = FrameTransport::from_transport(transport, 1024);
            frames
                .write_packet(&RawPacket::new(b"ping".to_vec()))
                .await
                .unwrap();
            frames.close().await.unwrap();
        });

        let transport = listener.accept().await.unwrap().await.unwrap();
        let mut frames = FrameTransport::from_transport(transport, 1024);
        assert_eq!(frames.reader().read_id().await.unwrap(), Some(0));
        let mut packet = RawPacket::default();
        packet.decode(frames.reader()).await.unwrap();
        assert_eq!(packet.payload(), b"ping");

        // 客户端关闭后读到正常关闭信号
        assert_eq!(frames.reader().read_id().await.unwrap(), None);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_transport_close_once() {
        let (local, _remote) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(local);
        let mut frames = FrameTransport::new(read, write, 64, None);

        frames.close().await.unwrap();
        assert!(frames.is_closed());
        frames.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_shares_writer() {
        let (local, remote) = tokio::io::duplex(1 << 16);
        let (read, write) = tokio::io::split(local);
        let frames = FrameTransport::new(read, write, 1024, None);
        let mut remote = FrameReader::new(remote, 1024);

        let sender = frames.sender();
        let tasks: Vec<_> = (0..4u8)
            .map(|i| {
                let sender = sender.clone();
                tokio::spawn(async move { sender.send(&RawPacket::new(vec![i; 32])).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // 并发发送的包各自完整，不交错
        let mut seen = Vec::new();
        for _ in 0..4 {
            assert_eq!(remote.read_id().await.unwrap(), Some(0));
            let mut packet = RawPacket::default();
            packet.decode(&mut remote).await.unwrap();
            let first = packet.payload()[0];
            assert!(packet.payload().iter().all(|b| *b == first));
            seen.push(first);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
