//! 二进制套接字协议库
//!
//! 在持久的 TCP（可选 TLS）连接上收发带数值 ID 的类型化包。
//!
//! 包含:
//! - 帧读写 (FrameReader, FrameWriter)
//! - 包类型约定与内置原始包 (Packet, RawPacket)
//! - 包注册表与处理器表 (PacketRegistry, PacketHandlers)
//! - 传输层抽象 (Transport trait，TCP / TLS 实现)
//! - 连接封装与分发循环 (Connection)
//! - 服务端监听器与客户端连接器 (Listener, Connector)
//!
//! 线上格式（大端序）：`packet := id:i32, 字段...`

mod client;
mod codec;
mod connection;
mod constants;
mod error;
mod packet;
mod registry;
mod server;
mod tls;
mod transport;

pub use client::Connector;
pub use codec::{FrameReader, FrameWriter};
pub use connection::{CloseReason, Connection, ConnectionHandle, ConnectionState};
pub use constants::*;
pub use error::{ProtocolError, Result};
pub use packet::{Envelope, Packet, RawPacket};
pub use registry::{PacketHandlers, PacketKind, PacketRegistry};
pub use server::Listener;
pub use tls::{TlsClientConfig, TlsListener, TlsServerConfig, TlsTransport};
pub use transport::{
    FrameTransport, PacketSender, TcpListener, TcpTransport, Transport, TransportConfig,
    TransportListener,
};

pub use futures::future::BoxFuture;
