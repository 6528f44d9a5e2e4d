//! 协议常量定义

use std::time::Duration;

/// 默认读写缓冲区大小（字节），同时用于套接字收发缓冲区
pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// 内置原始包的 ID
pub const RAW_PACKET_ID: i32 = 0;

/// 带长度前缀的负载最大长度
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// 监听队列长度
pub const LISTEN_BACKLOG: u32 = 1024;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 监听器关闭时等待连接退出的最长时间
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
