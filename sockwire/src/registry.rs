//! 包注册表
//!
//! 两张必须保持一致的映射：
//! - `ID -> 包类型`：解码时确定数值 ID 对应的类型
//! - `包类型 -> 处理器`：分发时确定由谁处理已解码的实例
//!
//! 注册只发生在启动阶段；注册表随后以 `Arc<PacketRegistry>` 交给
//! [`Listener`](crate::Listener) 或 [`Connector`](crate::Connector)，
//! 在通信期间只读。

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use tracing::debug;

use crate::codec::FrameReader;
use crate::error::{ProtocolError, Result};
use crate::packet::{Envelope, Packet, RawPacket};
use crate::transport::FrameTransport;

type DecodeFn = for<'a> fn(&'a mut FrameReader) -> BoxFuture<'a, Result<Box<dyn Envelope>>>;

fn decode_erased<P: Packet>(reader: &mut FrameReader) -> BoxFuture<'_, Result<Box<dyn Envelope>>> {
    Box::pin(async move {
        let mut packet = P::default();
        packet.decode(reader).await?;
        Ok(Box::new(packet) as Box<dyn Envelope>)
    })
}

/// 包类型标签：ID、类型名与构造解码函数
#[derive(Clone, Copy)]
pub struct PacketKind {
    id: i32,
    name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

impl PacketKind {
    pub fn of<P: Packet>() -> Self {
        Self {
            id: P::ID,
            name: std::any::type_name::<P>(),
            type_id: TypeId::of::<P>(),
            decode: decode_erased::<P>,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<P: Packet>(&self) -> bool {
        self.type_id == TypeId::of::<P>()
    }

    /// 创建空实例并从读取端解码（ID 已被读取）
    pub fn decode<'a>(&self, reader: &'a mut FrameReader) -> BoxFuture<'a, Result<Box<dyn Envelope>>> {
        (self.decode)(reader)
    }
}

impl fmt::Debug for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKind")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

trait ErasedHandler: Send + Sync {
    fn call<'a>(
        &'a self,
        envelope: Box<dyn Envelope>,
        transport: &'a mut FrameTransport,
    ) -> BoxFuture<'a, Result<()>>;
}

struct TypedHandler<P, F> {
    handler: F,
    _kind: PhantomData<fn(P)>,
}

impl<P, F> ErasedHandler for TypedHandler<P, F>
where
    P: Packet,
    F: for<'t> Fn(P, &'t mut FrameTransport) -> BoxFuture<'t, Result<()>> + Send + Sync,
{
    fn call<'a>(
        &'a self,
        envelope: Box<dyn Envelope>,
        transport: &'a mut FrameTransport,
    ) -> BoxFuture<'a, Result<()>> {
        let actual = envelope.kind_name();
        match envelope.into_any().downcast::<P>() {
            Ok(packet) => (self.handler)(*packet, transport),
            Err(_) => Box::pin(async move {
                Err(ProtocolError::KindMismatch {
                    expected: std::any::type_name::<P>(),
                    actual,
                })
            }),
        }
    }
}

/// 包类型到处理器的显式映射
///
/// 处理器拿到已解码的包和所在连接的传输层，可以在同一连接上直接回复。
///
/// # Example
/// ```
/// use sockwire::{PacketHandlers, RawPacket};
///
/// let handlers = PacketHandlers::new().on::<RawPacket, _>(|packet, transport| {
///     Box::pin(async move { transport.write_packet(&packet).await })
/// });
/// assert!(handlers.handles::<RawPacket>());
/// ```
#[derive(Default)]
pub struct PacketHandlers {
    handlers: HashMap<TypeId, Box<dyn ErasedHandler>>,
}

impl PacketHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为包类型 `P` 注册处理器，同一类型重复注册时以后者为准
    pub fn on<P, F>(mut self, handler: F) -> Self
    where
        P: Packet,
        F: for<'t> Fn(P, &'t mut FrameTransport) -> BoxFuture<'t, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let typed = TypedHandler::<P, F> {
            handler,
            _kind: PhantomData,
        };
        self.handlers.insert(TypeId::of::<P>(), Box::new(typed));
        self
    }

    pub fn handles<P: Packet>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<P>())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for PacketHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHandlers")
            .field("len", &self.handlers.len())
            .finish()
    }
}

/// 包注册表
pub struct PacketRegistry {
    kinds: HashMap<i32, PacketKind>,
    handlers: PacketHandlers,
}

impl PacketRegistry {
    /// 创建注册表，内置原始包已注册
    pub fn new() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
            handlers: PacketHandlers::new(),
        };
        registry.register::<RawPacket>();
        registry
    }

    /// 将 `P::ID` 关联到包类型 `P`
    ///
    /// 不检查唯一性：同一 ID 的旧映射被覆盖并返回，ID 的分配由调用方协调。
    pub fn register<P: Packet>(&mut self) -> Option<PacketKind> {
        let kind = PacketKind::of::<P>();
        let previous = self.kinds.insert(kind.id, kind);
        if let Some(old) = &previous {
            debug!(id = kind.id, old = old.name, new = kind.name, "Packet id remapped");
        }
        previous
    }

    /// 整体替换处理器映射
    pub fn set_handlers(&mut self, handlers: PacketHandlers) {
        self.handlers = handlers;
    }

    /// 查找 ID 对应的包类型
    pub fn resolve(&self, id: i32) -> Option<&PacketKind> {
        self.kinds.get(&id)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &PacketKind> {
        self.kinds.values()
    }

    pub fn has_handler<P: Packet>(&self) -> bool {
        self.handlers.handles::<P>()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// 调用包所属类型的处理器
    ///
    /// 没有处理器时返回 [`ProtocolError::NoHandler`]，属于配置错误。
    pub async fn dispatch(
        &self,
        envelope: Box<dyn Envelope>,
        transport: &mut FrameTransport,
    ) -> Result<()> {
        let handler = self
            .handlers
            .handlers
            .get(&envelope.kind_id())
            .ok_or(ProtocolError::NoHandler {
                kind: envelope.kind_name(),
            })?;
        handler.call(envelope, transport).await
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("kinds", &self.kinds)
            .field("handlers", &self.handlers)
            .finish()
    }
}
