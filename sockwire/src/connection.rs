//! 连接封装
//!
//! 每条连接在自己的任务上运行分发循环:
//!
//! ```text
//! Idle ──start──▶ Reading ──▶ Decoding ──▶ Dispatching ──┐
//!                    ▲                                    │
//!                    └────────────────────────────────────┘
//!           任一阶段关闭或出错 ──▶ Closed(reason)
//! ```
//!
//! 处理器在连接自己的任务上同步执行，慢处理器只会阻塞本连接的读取。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::registry::PacketRegistry;
use crate::transport::{FrameTransport, PacketSender};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接关闭原因
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端正常关闭（或重置）
    Graceful,
    /// 本地请求关闭
    Shutdown,
    /// 收到未注册的包 ID，流已无法同步
    UnknownPacket(i32),
    /// 解码、传输或处理器错误
    Error(String),
}

/// 连接状态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// 已创建，尚未启动
    Idle,
    /// 等待读取包 ID
    Reading,
    /// 正在解码包字段
    Decoding,
    /// 正在执行处理器
    Dispatching,
    /// 已关闭（终态）
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

/// 连接句柄
///
/// 可克隆，用于查询状态、主动发送和请求关闭。
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer_addr: Option<SocketAddr>,
    sender: PacketSender,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// 当前状态快照
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }

    /// 等待连接关闭，返回关闭原因
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if let ConnectionState::Closed(reason) = current {
                return reason;
            }
            if state.changed().await.is_err() {
                // 连接任务未经正常流程退出（例如 panic）
                let current = state.borrow().clone();
                return match current {
                    ConnectionState::Closed(reason) => reason,
                    _ => CloseReason::Error("connection task ended unexpectedly".to_string()),
                };
            }
        }
    }

    /// 在此连接上发送一个包
    pub async fn send<P: Packet>(&self, packet: &P) -> Result<()> {
        self.sender.send(packet).await
    }

    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    /// 请求关闭连接
    ///
    /// 等待包 ID 或解码途中的分发循环立即退出并关闭传输；正在执行的处理器不会被中断。
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// 连接
///
/// 独占一个 [`FrameTransport`]，按注册表解码并分发收到的包。
pub struct Connection {
    transport: FrameTransport,
    registry: Arc<PacketRegistry>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    handle: ConnectionHandle,
}

impl Connection {
    pub fn new(transport: FrameTransport, registry: Arc<PacketRegistry>) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = ConnectionHandle {
            id,
            peer_addr: transport.peer_addr(),
            sender: transport.sender(),
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
        };

        Self {
            transport,
            registry,
            state: state_tx,
            shutdown: shutdown_rx,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// 在新任务上运行分发循环
    pub fn start(self) -> ConnectionHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// 运行分发循环直到连接关闭
    ///
    /// 退出前关闭传输（仅一次），并把状态置为 [`ConnectionState::Closed`]。
    pub async fn run(mut self) -> CloseReason {
        let id = self.handle.id;
        let peer = self.handle.peer_addr;
        debug!(connection = id, ?peer, "Connection started");

        let reason = self.dispatch_loop().await;
        match &reason {
            CloseReason::Graceful => info!(connection = id, ?peer, "Connection closed by peer"),
            CloseReason::Shutdown => info!(connection = id, ?peer, "Connection shut down"),
            CloseReason::UnknownPacket(packet_id) => error!(
                connection = id,
                ?peer,
                packet_id,
                "Unknown packet id, closing connection"
            ),
            CloseReason::Error(message) => error!(
                connection = id,
                ?peer,
                error = %message,
                "Connection failed"
            ),
        }

        if let Err(e) = self.transport.close().await {
            debug!(connection = id, error = %e, "Error while closing transport");
        }
        self.state.send_replace(ConnectionState::Closed(reason.clone()));
        reason
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn dispatch_loop(&mut self) -> CloseReason {
        loop {
            self.set_state(ConnectionState::Reading);
            let result = tokio::select! {
                result = self.transport.reader().read_id() => result,
                _ = shutdown_requested(&mut self.shutdown) => return CloseReason::Shutdown,
            };

            let packet_id = match result {
                Ok(Some(packet_id)) => packet_id,
                Ok(None) => return CloseReason::Graceful,
                Err(e) if e.is_graceful_close() => return CloseReason::Graceful,
                Err(e) => return CloseReason::Error(e.to_string()),
            };

            // 未知 ID 无法确定负载长度，不能跳过
            let Some(kind) = self.registry.resolve(packet_id).copied() else {
                return CloseReason::UnknownPacket(packet_id);
            };

            // 帧读到一半时也响应关闭请求
            self.set_state(ConnectionState::Decoding);
            let decoded = tokio::select! {
                result = kind.decode(self.transport.reader()) => result,
                _ = shutdown_requested(&mut self.shutdown) => return CloseReason::Shutdown,
            };
            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(e) if e.is_graceful_close() => return CloseReason::Graceful,
                Err(e) => {
                    return CloseReason::Error(format!("failed to decode {}: {e}", kind.name()))
                }
            };
            if self.transport.reader().is_closed() {
                // 帧被截断
                return CloseReason::Graceful;
            }
            debug!(
                connection = self.handle.id,
                packet_id,
                kind = kind.name(),
                "Packet received"
            );

            self.set_state(ConnectionState::Dispatching);
            match self.registry.dispatch(envelope, &mut self.transport).await {
                Ok(()) => {}
                Err(ProtocolError::NoHandler { kind }) => {
                    error!(
                        connection = self.handle.id,
                        kind, "No handler registered for packet kind, packet dropped"
                    );
                }
                Err(e) if e.is_graceful_close() => return CloseReason::Graceful,
                Err(e) => return CloseReason::Error(e.to_string()),
            }
        }
    }
}

pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        // 句柄全部释放，不会再有关闭请求
        std::future::pending::<()>().await;
    }
}
