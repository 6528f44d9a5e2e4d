//! 包类型约定
//!
//! 每种包有固定的数值 ID，自行负责字段的编码与解码。
//! 解码必须恰好消费编码写出的字节，否则同一连接上的下一次 ID 读取会错位，
//! 且无法恢复。

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::Result;
use crate::RAW_PACKET_ID;

/// 包类型
///
/// 必须可默认构造：分发器先创建空实例，再调用 [`Packet::decode`] 填充字段。
///
/// # Example
/// ```
/// use sockwire::{FrameReader, FrameWriter, Packet, Result};
///
/// #[derive(Debug, Default, PartialEq)]
/// struct Heartbeat {
///     sequence: i64,
/// }
///
/// impl Packet for Heartbeat {
///     const ID: i32 = 3;
///
///     async fn encode_fields(&self, writer: &mut FrameWriter) -> Result<()> {
///         writer.write_i64(self.sequence).await
///     }
///
///     async fn decode(&mut self, reader: &mut FrameReader) -> Result<()> {
///         self.sequence = reader.read_i64().await?;
///         Ok(())
///     }
/// }
/// ```
pub trait Packet: Default + fmt::Debug + Send + Sync + 'static {
    /// 线上的包 ID
    const ID: i32;

    /// 按固定顺序写出本类型的字段（不含 ID）
    fn encode_fields(&self, writer: &mut FrameWriter) -> impl Future<Output = Result<()>> + Send;

    /// 读取字段填充自身，ID 已由调用方读取
    fn decode(&mut self, reader: &mut FrameReader) -> impl Future<Output = Result<()>> + Send;

    /// 先写 ID，再写字段
    fn encode(&self, writer: &mut FrameWriter) -> impl Future<Output = Result<()>> + Send {
        async move {
            writer.write_i32(Self::ID).await?;
            self.encode_fields(writer).await
        }
    }
}

/// 已解码包的类型擦除视图，供注册表分发使用
pub trait Envelope: Send + fmt::Debug {
    fn packet_id(&self) -> i32;

    fn kind_name(&self) -> &'static str;

    fn kind_id(&self) -> TypeId;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<P: Packet> Envelope for P {
    fn packet_id(&self) -> i32 {
        P::ID
    }

    fn kind_name(&self) -> &'static str {
        std::any::type_name::<P>()
    }

    fn kind_id(&self) -> TypeId {
        TypeId::of::<P>()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// 内置原始包（ID = 0）
///
/// 线上格式为 `length:i32, bytes[length]`，字节内容由附带值自行解释，
/// 用于不值得单独定义包类型的临时数据。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPacket {
    payload: Vec<u8>,
}

impl RawPacket {
    /// 直接携带原始字节
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// 携带任意可序列化的值（bincode 编码）
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            payload: bincode::serialize(value)?,
        })
    }

    /// 按附带值的类型解释负载
    pub fn value<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl Packet for RawPacket {
    const ID: i32 = RAW_PACKET_ID;

    async fn encode_fields(&self, writer: &mut FrameWriter) -> Result<()> {
        writer.write_prefixed_bytes(&self.payload).await
    }

    async fn decode(&mut self, reader: &mut FrameReader) -> Result<()> {
        self.payload = reader.read_prefixed_bytes().await?;
        Ok(())
    }
}
