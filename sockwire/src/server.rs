//! 服务端监听器
//!
//! 接受循环运行在独立任务上，每条接入的连接再各自占用一个任务。

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::connection::{shutdown_requested, Connection, ConnectionHandle};
use crate::error::{ProtocolError, Result};
use crate::registry::PacketRegistry;
use crate::tls::{TlsListener, TlsServerConfig};
use crate::transport::{FrameTransport, TcpListener, Transport, TransportConfig, TransportListener};
use crate::SHUTDOWN_TIMEOUT;

/// 在线连接表: connection_id -> handle
type ConnectionTable = Arc<RwLock<HashMap<u64, ConnectionHandle>>>;

/// 监听器
///
/// 丢弃 `Listener` 会停止接受新连接，已建立的连接继续运行；
/// 需要一并关闭时使用 [`Listener::shutdown`]。
pub struct Listener {
    local_addr: SocketAddr,
    connections: ConnectionTable,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<Result<()>>,
}

impl Listener {
    /// 绑定 TCP 地址并开始接受连接
    pub async fn start(
        addr: &str,
        config: &TransportConfig,
        registry: Arc<PacketRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr, config).await?;
        Self::serve(listener, config, registry)
    }

    /// 绑定 TLS 地址并开始接受连接
    pub async fn start_tls(
        addr: &str,
        config: &TransportConfig,
        tls: &TlsServerConfig,
        registry: Arc<PacketRegistry>,
    ) -> Result<Self> {
        let listener = TlsListener::bind(addr, config, tls).await?;
        Self::serve(listener, config, registry)
    }

    /// 在任意传输监听器上运行接受循环
    ///
    /// `config.buffer_size` 决定每条连接的读写缓冲区，
    /// `config.connect_timeout` 限制每条连接的握手时间。
    pub fn serve<L: TransportListener>(
        listener: L,
        config: &TransportConfig,
        registry: Arc<PacketRegistry>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let connections = ConnectionTable::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(%local_addr, kinds = registry.len(), "Listener started");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            config.clone(),
            registry,
            Arc::clone(&connections),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            connections,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 当前在线连接
    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 接受循环是否仍在运行
    pub fn is_running(&self) -> bool {
        !self.accept_task.is_finished()
    }

    /// 运行直到 `signal` 完成或监听器失效
    ///
    /// `signal` 先完成时执行 [`Listener::shutdown`]。
    pub async fn run_until<F: Future<Output = ()>>(mut self, signal: F) -> Result<()> {
        let stopped = tokio::select! {
            result = join_accept_task(&mut self.accept_task) => Some(result),
            _ = signal => None,
        };
        match stopped {
            Some(result) => result,
            None => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                self.shutdown().await
            }
        }
    }

    /// 停止接受新连接，请求所有在线连接关闭并等待它们退出
    ///
    /// 返回接受循环的结果：监听器此前已因 accept 失败而停止时返回该错误。
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        let result = join_accept_task(&mut self.accept_task).await;

        let handles = self.connections().await;
        for handle in &handles {
            handle.close();
        }
        let all_closed = join_all(handles.iter().map(|handle| handle.closed()));
        if timeout(SHUTDOWN_TIMEOUT, all_closed).await.is_err() {
            let remaining = self.connection_count().await;
            warn!(remaining, "Shutdown timeout, connections still active");
        }

        info!(local_addr = %self.local_addr, "Listener shut down");
        result
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn join_accept_task(task: &mut JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ProtocolError::Io(io::Error::other(e))),
    }
}

/// 接受循环
///
/// accept 失败对监听器是致命的：循环退出，监听端口随 `listener` 一起释放。
async fn accept_loop<L: TransportListener>(
    listener: L,
    config: TransportConfig,
    registry: Arc<PacketRegistry>,
    connections: ConnectionTable,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let handshake = tokio::select! {
            result = listener.accept() => match result {
                Ok(handshake) => handshake,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection, listener stopped");
                    return Err(e);
                }
            },
            _ = shutdown_requested(&mut shutdown) => {
                debug!("Accept loop stopped");
                return Ok(());
            }
        };

        tokio::spawn(serve_connection(
            handshake,
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&connections),
            shutdown.clone(),
        ));
    }
}

/// 在连接自己的任务上完成握手并运行分发循环，退出后从在线表中移除
///
/// 握手受 `config.connect_timeout` 限制，监听器关闭时立即放弃。
async fn serve_connection<H, T>(
    handshake: H,
    config: TransportConfig,
    registry: Arc<PacketRegistry>,
    connections: ConnectionTable,
    mut shutdown: watch::Receiver<bool>,
) where
    H: Future<Output = Result<T>>,
    T: Transport,
{
    let result = tokio::select! {
        result = timeout(config.connect_timeout, handshake) => result,
        _ = shutdown_requested(&mut shutdown) => {
            debug!("Listener shutting down, handshake abandoned");
            return;
        }
    };
    let transport = match result {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            warn!(error = %e, "Connection handshake failed");
            return;
        }
        Err(_) => {
            warn!(timeout = ?config.connect_timeout, "Connection handshake timed out");
            return;
        }
    };

    let connection = Connection::new(
        FrameTransport::from_transport(transport, config.buffer_size),
        registry,
    );
    let handle = connection.handle();
    let id = handle.id();

    connections.write().await.insert(id, handle.clone());
    info!(connection = id, peer = ?handle.peer_addr(), "Client connected");

    // 握手期间监听器已开始关闭
    let stopping = *shutdown.borrow();
    if stopping {
        handle.close();
    }

    connection.run().await;
    connections.write().await.remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connector;
    use crate::connection::CloseReason;
    use std::time::Duration;

    async fn wait_for_count(listener: &Listener, expected: usize) {
        for _ in 0..200 {
            if listener.connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} connections, found {}",
            listener.connection_count().await
        );
    }

    #[tokio::test]
    async fn test_listener_start() {
        let listener = Listener::start(
            "127.0.0.1:0",
            &TransportConfig::default(),
            Arc::new(PacketRegistry::new()),
        )
        .await
        .unwrap();

        assert!(listener.local_addr().port() > 0);
        assert!(listener.is_running());
        assert_eq!(listener.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_connections() {
        let registry = Arc::new(PacketRegistry::new());
        let listener = Listener::start("127.0.0.1:0", &TransportConfig::default(), registry.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let client = Connector::new(addr.as_str(), TransportConfig::default())
            .connect(registry)
            .await
            .unwrap();
        wait_for_count(&listener, 1).await;
        let server_side = listener.connections().await.remove(0);

        listener.shutdown().await.unwrap();

        assert_eq!(server_side.closed().await, CloseReason::Shutdown);
        let reason = tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::Graceful);

        // 端口已释放，新的连接被拒绝
        let result = Connector::new(addr.as_str(), TransportConfig::default())
            .connect(Arc::new(PacketRegistry::new()))
            .await;
        assert!(result.is_err());
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_shutdown_futures_are_send() {
        let listener = Listener::start(
            "127.0.0.1:0",
            &TransportConfig::default(),
            Arc::new(PacketRegistry::new()),
        )
        .await
        .unwrap();
        assert_send(listener.shutdown());

        let listener = Listener::start(
            "127.0.0.1:0",
            &TransportConfig::default(),
            Arc::new(PacketRegistry::new()),
        )
        .await
        .unwrap();
        assert_send(listener.run_until(std::future::pending::<()>()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection_stalled_mid_frame() {
        let listener = Listener::start(
            "127.0.0.1:0",
            &TransportConfig::default(),
            Arc::new(PacketRegistry::new()),
        )
        .await
        .unwrap();

        // ID 加半个长度前缀，随后保持沉默
        let mut stream = tokio::net::TcpStream::connect(listener.local_addr())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, &[0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        wait_for_count(&listener, 1).await;
        let server_side = listener.connections().await.remove(0);

        let started = std::time::Instant::now();
        listener.shutdown().await.unwrap();
        assert!(started.elapsed() < SHUTDOWN_TIMEOUT);
        assert_eq!(server_side.closed().await, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_run_until_signal() {
        let listener = Listener::start(
            "127.0.0.1:0",
            &TransportConfig::default(),
            Arc::new(PacketRegistry::new()),
        )
        .await
        .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(listener.run_until(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
