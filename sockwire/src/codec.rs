//! 帧读写
//!
//! 所有定长数值均为网络字节序（大端）:
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │  ID (4B)   │   按包类型定义的字段序列       │
//! │  i32 BE    │                              │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! 写入端每次写操作后立即 flush，不在多次调用之间合并。

use std::io;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};

use crate::error::{is_disconnect, ProtocolError, Result};
use crate::packet::Packet;
use crate::MAX_PAYLOAD_LEN;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

macro_rules! read_fixed {
    ($($name:ident -> $ty:ty),* $(,)?) => {
        $(
            pub async fn $name(&mut self) -> Result<$ty> {
                let result = self.inner.$name().await;
                match result {
                    Ok(value) => Ok(value),
                    Err(e) => Err(self.fail(e)),
                }
            }
        )*
    };
}

macro_rules! write_fixed {
    ($($name:ident($ty:ty)),* $(,)?) => {
        $(
            pub async fn $name(&mut self, value: $ty) -> Result<()> {
                self.inner.$name(value).await?;
                self.flush().await
            }
        )*
    };
}

/// 帧读取器
///
/// 对端重置或提前断开视为正常关闭：定长读取返回
/// [`ProtocolError::ConnectionClosed`]，`read_id` 返回 `None`，
/// `read_bytes` 返回空数组。
pub struct FrameReader {
    inner: BufReader<BoxedReader>,
    closed: bool,
}

impl FrameReader {
    /// 创建新的帧读取器
    pub fn new<R>(reader: R, buffer_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: BufReader::with_capacity(buffer_size, Box::new(reader) as BoxedReader),
            closed: false,
        }
    }

    /// 是否已观察到对端关闭
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn fail(&mut self, err: io::Error) -> ProtocolError {
        if is_disconnect(&err) {
            self.closed = true;
            ProtocolError::ConnectionClosed
        } else {
            ProtocolError::Io(err)
        }
    }

    read_fixed! {
        read_i8 -> i8,
        read_u8 -> u8,
        read_i16 -> i16,
        read_u16 -> u16,
        read_i32 -> i32,
        read_i64 -> i64,
        read_f32 -> f32,
        read_f64 -> f64,
    }

    pub async fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8().await? != 0)
    }

    /// 读取包 ID，对端关闭时返回 `None`
    pub async fn read_id(&mut self) -> Result<Option<i32>> {
        match self.read_i32().await {
            Ok(id) => Ok(Some(id)),
            Err(ProtocolError::ConnectionClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 读取恰好 `len` 个字节，对端关闭时返回空数组
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let result = self.inner.read_exact(&mut buf).await;
        match result {
            Ok(_) => Ok(buf),
            Err(e) if is_disconnect(&e) => {
                self.closed = true;
                Ok(Vec::new())
            }
            Err(e) => Err(ProtocolError::Io(e)),
        }
    }

    /// 读取 `len` 个字节并按 UTF-8 解码（非法序列替换为 U+FFFD）
    pub async fn read_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 读取 32 位长度前缀及其后的字节
    pub async fn read_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_i32().await?;
        let len = usize::try_from(length).map_err(|_| ProtocolError::InvalidLength { length })?;
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let bytes = self.read_bytes(len).await?;
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(bytes)
    }

    pub async fn read_prefixed_string(&mut self) -> Result<String> {
        let bytes = self.read_prefixed_bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// 帧写入器
pub struct FrameWriter {
    inner: BufWriter<BoxedWriter>,
    closed: bool,
}

impl FrameWriter {
    /// 创建新的帧写入器
    pub fn new<W>(writer: W, buffer_size: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: BufWriter::with_capacity(buffer_size, Box::new(writer) as BoxedWriter),
            closed: false,
        }
    }

    write_fixed! {
        write_i8(i8),
        write_u8(u8),
        write_i16(i16),
        write_u16(u16),
        write_i32(i32),
        write_i64(i64),
        write_f32(f32),
        write_f64(f64),
    }

    pub async fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value)).await
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.flush().await
    }

    /// 写入 32 位长度前缀及字节
    pub async fn write_prefixed_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        // MAX_PAYLOAD_LEN < i32::MAX
        self.write_i32(data.len() as i32).await?;
        self.write_bytes(data).await
    }

    pub async fn write_prefixed_string(&mut self, value: &str) -> Result<()> {
        self.write_prefixed_bytes(value.as_bytes()).await
    }

    /// 编码并写入一个完整的包（ID + 字段）
    pub async fn write_packet<P: Packet>(&mut self, packet: &P) -> Result<()> {
        packet.encode(self).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// 关闭写入端，重复调用无副作用
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
