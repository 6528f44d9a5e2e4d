//! 错误类型定义

use std::io;

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// 序列化错误（原始包的附带值）
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// 连接已关闭（对端正常关闭或重置，不视为故障）
    #[error("Connection closed")]
    ConnectionClosed,

    /// 未注册的包 ID，流无法重新同步
    #[error("Unknown packet id: {id}")]
    UnknownPacket { id: i32 },

    /// 已解析的包类型没有注册处理器
    #[error("No handler registered for packet kind {kind}")]
    NoHandler { kind: &'static str },

    /// 处理器收到了与其声明类型不一致的包
    #[error("Handler for {expected} received a packet of kind {actual}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// 长度前缀为负数
    #[error("Invalid length prefix: {length}")]
    InvalidLength { length: i32 },

    /// 负载超过上限
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// 地址无法解析
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// TLS 配置或握手错误
    #[error("TLS error: {0}")]
    Tls(String),
}

impl ProtocolError {
    /// 是否为正常关闭信号（而非故障）
    pub fn is_graceful_close(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => is_disconnect(e),
            _ => false,
        }
    }
}

/// 读取时遇到的断开类错误，按正常关闭处理
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl From<rustls::Error> for ProtocolError {
    fn from(err: rustls::Error) -> Self {
        ProtocolError::Tls(err.to_string())
    }
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
