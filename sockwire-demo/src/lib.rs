//! 演示应用共享定义
//!
//! - `Say` (ID 1)：客户端发出的一行文本
//! - `Echo` (ID 2)：服务端对 `Say` 的回复
//! - `Notice`：经内置原始包携带的通知

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sockwire::{
    FrameReader, FrameWriter, Packet, PacketHandlers, PacketRegistry, RawPacket, Result,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 默认服务器地址
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// 客户端发出的文本
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Say {
    pub author: String,
    pub text: String,
}

impl Packet for Say {
    const ID: i32 = 1;

    async fn encode_fields(&self, writer: &mut FrameWriter) -> Result<()> {
        writer.write_prefixed_string(&self.author).await?;
        writer.write_prefixed_string(&self.text).await
    }

    async fn decode(&mut self, reader: &mut FrameReader) -> Result<()> {
        self.author = reader.read_prefixed_string().await?;
        self.text = reader.read_prefixed_string().await?;
        Ok(())
    }
}

/// 服务端回复
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Echo {
    pub text: String,
    /// 服务端收到 `Say` 的时间（Unix 毫秒）
    pub received_at_ms: i64,
}

impl Packet for Echo {
    const ID: i32 = 2;

    async fn encode_fields(&self, writer: &mut FrameWriter) -> Result<()> {
        writer.write_prefixed_string(&self.text).await?;
        writer.write_i64(self.received_at_ms).await
    }

    async fn decode(&mut self, reader: &mut FrameReader) -> Result<()> {
        self.text = reader.read_prefixed_string().await?;
        self.received_at_ms = reader.read_i64().await?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
}

/// 通知，序列化后作为原始包负载发送
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn into_packet(self) -> Result<RawPacket> {
        RawPacket::from_value(&self)
    }
}

/// 当前 Unix 毫秒时间戳
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

fn log_notice(packet: &RawPacket) {
    match packet.value::<Notice>() {
        Ok(notice) => match notice.level {
            NoticeLevel::Info => info!(message = %notice.message, "Notice"),
            NoticeLevel::Warning => warn!(message = %notice.message, "Notice"),
        },
        Err(e) => warn!(len = packet.len(), error = %e, "Raw payload is not a notice"),
    }
}

/// 服务端注册表：`Say` 回复 `Echo`，原始包按通知记录日志
pub fn server_registry() -> Arc<PacketRegistry> {
    let mut registry = PacketRegistry::new();
    registry.register::<Say>();
    registry.register::<Echo>();

    registry.set_handlers(
        PacketHandlers::new()
            .on::<Say, _>(|say, transport| {
                Box::pin(async move {
                    debug!(author = %say.author, text = %say.text, "Say received");
                    let echo = Echo {
                        text: format!("{}: {}", say.author, say.text),
                        received_at_ms: now_ms(),
                    };
                    transport.write_packet(&echo).await
                })
            })
            .on::<RawPacket, _>(|packet, _transport| {
                log_notice(&packet);
                Box::pin(async { Ok(()) })
            }),
    );
    Arc::new(registry)
}

/// 客户端注册表：收到的 `Echo` 转发到 `echoes`
pub fn client_registry(echoes: mpsc::UnboundedSender<Echo>) -> Arc<PacketRegistry> {
    let mut registry = PacketRegistry::new();
    registry.register::<Say>();
    registry.register::<Echo>();

    registry.set_handlers(
        PacketHandlers::new()
            .on::<Echo, _>(move |echo, _transport| {
                if echoes.send(echo).is_err() {
                    debug!("Echo receiver dropped");
                }
                Box::pin(async { Ok(()) })
            })
            .on::<RawPacket, _>(|packet, _transport| {
                log_notice(&packet);
                Box::pin(async { Ok(()) })
            }),
    );
    Arc::new(registry)
}
