//! 监听器 / 连接器端到端测试
//!
//! 在回环地址上启动真实的 TCP 监听器，验证分发、隔离与连接表维护。

use std::sync::Arc;
use std::time::Duration;

use sockwire::{
    CloseReason, ConnectionHandle, ConnectionState, Connector, FrameReader, FrameWriter,
    Listener, Packet, PacketHandlers, PacketRegistry, RawPacket, Result, TransportConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[derive(Debug, Default, Clone, PartialEq)]
struct Move {
    entity: i64,
    x: f64,
    y: f64,
    sneaking: bool,
}

impl Packet for Move {
    const ID: i32 = 7;

    async fn encode_fields(&self, writer: &mut FrameWriter) -> Result<()> {
        writer.write_i64(self.entity).await?;
        writer.write_f64(self.x).await?;
        writer.write_f64(self.y).await?;
        writer.write_bool(self.sneaking).await
    }

    async fn decode(&mut self, reader: &mut FrameReader) -> Result<()> {
        self.entity = reader.read_i64().await?;
        self.x = reader.read_f64().await?;
        self.y = reader.read_f64().await?;
        self.sneaking = reader.read_bool().await?;
        Ok(())
    }
}

fn moved(entity: i64) -> Move {
    Move {
        entity,
        x: 10.5,
        y: -3.25,
        sneaking: entity % 2 == 0,
    }
}

/// 服务端注册表：收到的 Move 转发到通道
fn recording_registry() -> (Arc<PacketRegistry>, mpsc::UnboundedReceiver<Move>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = PacketRegistry::new();
    registry.register::<Move>();
    registry.set_handlers(PacketHandlers::new().on::<Move, _>(move |packet, _transport| {
        let _ = tx.send(packet);
        Box::pin(async { Ok(()) })
    }));
    (Arc::new(registry), rx)
}

async fn start_listener(registry: Arc<PacketRegistry>) -> Listener {
    Listener::start("127.0.0.1:0", &TransportConfig::default(), registry)
        .await
        .unwrap()
}

async fn connect(listener: &Listener, registry: Arc<PacketRegistry>) -> ConnectionHandle {
    Connector::new(listener.local_addr().to_string(), TransportConfig::default())
        .connect(registry)
        .await
        .unwrap()
}

async fn wait_for_count(listener: &Listener, expected: usize) {
    for _ in 0..500 {
        if listener.connection_count().await == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} live connections, found {}",
        listener.connection_count().await
    );
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Move>) -> Move {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("handler channel closed")
}

#[tokio::test]
async fn test_handler_invoked_once_with_equal_packet() {
    let (registry, mut rx) = recording_registry();
    let listener = start_listener(registry).await;

    let client = connect(&listener, Arc::new(PacketRegistry::new())).await;
    let sent = moved(42);
    client.send(&sent).await.unwrap();

    assert_eq!(recv(&mut rx).await, sent);
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "handler invoked more than once");
}

#[tokio::test]
async fn test_packets_dispatched_in_order() {
    let (registry, mut rx) = recording_registry();
    let listener = start_listener(registry).await;

    let client = connect(&listener, Arc::new(PacketRegistry::new())).await;
    for entity in 0..50 {
        client.send(&moved(entity)).await.unwrap();
    }

    for entity in 0..50 {
        assert_eq!(recv(&mut rx).await.entity, entity);
    }
}

#[tokio::test]
async fn test_handler_reply_reaches_client() {
    let mut server = PacketRegistry::new();
    server.register::<Move>();
    server.set_handlers(PacketHandlers::new().on::<Move, _>(|packet, transport| {
        Box::pin(async move {
            let ack = format!("ack {}", packet.entity);
            transport.write_packet(&RawPacket::new(ack.into_bytes())).await
        })
    }));
    let listener = start_listener(Arc::new(server)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = PacketRegistry::new();
    client.set_handlers(PacketHandlers::new().on::<RawPacket, _>(move |packet, _transport| {
        let _ = tx.send(packet.into_payload());
        Box::pin(async { Ok(()) })
    }));

    let handle = connect(&listener, Arc::new(client)).await;
    handle.send(&moved(9)).await.unwrap();

    let reply = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply, b"ack 9");
}

#[tokio::test]
async fn test_unknown_id_closes_only_that_connection() {
    let (registry, mut rx) = recording_registry();
    let listener = start_listener(registry).await;

    let mut rogue = TcpStream::connect(listener.local_addr()).await.unwrap();
    let healthy = connect(&listener, Arc::new(PacketRegistry::new())).await;
    wait_for_count(&listener, 2).await;

    rogue.write_all(&99i32.to_be_bytes()).await.unwrap();

    // 服务端关闭该连接，rogue 读到 EOF
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), rogue.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    wait_for_count(&listener, 1).await;
    assert!(listener.is_running());

    healthy.send(&moved(1)).await.unwrap();
    assert_eq!(recv(&mut rx).await, moved(1));
}

#[tokio::test]
async fn test_client_close_prunes_connection_and_keeps_listening() {
    let (registry, mut rx) = recording_registry();
    let listener = start_listener(registry).await;

    let first = connect(&listener, Arc::new(PacketRegistry::new())).await;
    wait_for_count(&listener, 1).await;

    first.close();
    assert_eq!(first.closed().await, CloseReason::Shutdown);
    wait_for_count(&listener, 0).await;
    assert!(listener.is_running());

    let second = connect(&listener, Arc::new(PacketRegistry::new())).await;
    second.send(&moved(2)).await.unwrap();
    assert_eq!(recv(&mut rx).await, moved(2));
}

#[tokio::test]
async fn test_abrupt_disconnect_is_graceful() {
    let (registry, _rx) = recording_registry();
    let listener = start_listener(registry).await;

    let stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    wait_for_count(&listener, 1).await;
    let server_side = listener.connections().await.remove(0);

    // 帧写到一半就断开
    let mut stream = stream;
    stream.write_all(&Move::ID.to_be_bytes()).await.unwrap();
    stream.write_all(&[0, 0, 0]).await.unwrap();
    drop(stream);

    let reason = timeout(Duration::from_secs(5), server_side.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Graceful);
    wait_for_count(&listener, 0).await;
}

#[tokio::test]
async fn test_many_concurrent_connections() {
    let (registry, mut rx) = recording_registry();
    let listener = start_listener(registry).await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(connect(&listener, Arc::new(PacketRegistry::new())).await);
    }
    wait_for_count(&listener, 8).await;

    for (entity, client) in clients.iter().enumerate() {
        client.send(&moved(entity as i64)).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..8 {
        seen.push(recv(&mut rx).await.entity);
    }
    seen.sort();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_custom_buffer_size() {
    let (registry, mut rx) = recording_registry();
    let config = TransportConfig::default().with_buffer_size(1024);
    let listener = Listener::start("127.0.0.1:0", &config, registry)
        .await
        .unwrap();

    let client = Connector::new(listener.local_addr().to_string(), config)
        .connect(Arc::new(PacketRegistry::new()))
        .await
        .unwrap();

    // 负载大于缓冲区
    let blob = RawPacket::new(vec![7u8; 8192]);
    client.send(&blob).await.unwrap();
    client.send(&moved(5)).await.unwrap();
    assert_eq!(recv(&mut rx).await, moved(5));
}

#[tokio::test]
async fn test_close_during_partial_frame() {
    let (registry, _rx) = recording_registry();
    let listener = start_listener(registry).await;

    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    wait_for_count(&listener, 1).await;
    let server_side = listener.connections().await.remove(0);

    // ID 加 3 字节字段，连接保持打开
    stream.write_all(&Move::ID.to_be_bytes()).await.unwrap();
    stream.write_all(&[0, 0, 0]).await.unwrap();
    for _ in 0..500 {
        if server_side.state() == ConnectionState::Decoding {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server_side.state(), ConnectionState::Decoding);

    server_side.close();
    let reason = timeout(Duration::from_secs(2), server_side.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Shutdown);
    wait_for_count(&listener, 0).await;

    // 服务端已关闭传输
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_shutdown_does_not_wait_on_stalled_frame() {
    let (registry, _rx) = recording_registry();
    let listener = start_listener(registry).await;

    let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
    wait_for_count(&listener, 1).await;
    let server_side = listener.connections().await.remove(0);
    stream.write_all(&Move::ID.to_be_bytes()).await.unwrap();
    stream.write_all(&[0, 0, 0]).await.unwrap();

    timeout(Duration::from_secs(2), listener.shutdown())
        .await
        .expect("shutdown waited on a stalled connection")
        .unwrap();
    assert_eq!(
        server_side.state(),
        ConnectionState::Closed(CloseReason::Shutdown)
    );
}
