//! 演示客户端
//!
//! 标准输入的每一行作为 `Say` 发送，收到的 `Echo` 打印到标准输出。

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sockwire::{Connector, TlsClientConfig, TransportConfig, DEFAULT_BUFFER_SIZE};
use sockwire_demo::{client_registry, Notice, Say, DEFAULT_ADDR};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sockwire-client", about = "Line client for the sockwire demo")]
struct Args {
    /// 服务器地址
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// 显示名
    #[arg(long, default_value = "guest")]
    name: String,

    /// 读写及套接字缓冲区大小（字节）
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// PEM 信任锚，指定后使用 TLS
    #[arg(long)]
    ca: Option<PathBuf>,

    /// 证书校验使用的服务器名，默认取地址的主机部分
    #[arg(long, requires = "ca")]
    server_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sockwire_client=info".parse()?)
                .add_directive("sockwire_demo=info".parse()?)
                .add_directive("sockwire=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = TransportConfig::default().with_buffer_size(args.buffer_size);
    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    let registry = client_registry(echo_tx);

    let connector = Connector::new(args.addr.as_str(), config);
    let handle = match &args.ca {
        Some(ca) => {
            let mut tls = TlsClientConfig::new(ca);
            if let Some(name) = &args.server_name {
                tls = tls.with_server_name(name.as_str());
            }
            connector.connect_tls(&tls, registry).await?
        }
        None => connector.connect(registry).await?,
    };
    info!(addr = %args.addr, name = %args.name, "Connected");

    handle
        .send(&Notice::info(format!("{} joined", args.name)).into_packet()?)
        .await?;

    tokio::spawn(async move {
        while let Some(echo) = echo_rx.recv().await {
            println!("[{}] {}", echo.received_at_ms, echo.text);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(text) = line? else {
                    break;
                };
                if text.trim().is_empty() {
                    continue;
                }
                handle
                    .send(&Say {
                        author: args.name.clone(),
                        text,
                    })
                    .await?;
            }
            reason = handle.closed() => {
                warn!(?reason, "Disconnected from server");
                return Ok(());
            }
        }
    }

    handle.close();
    let reason = handle.closed().await;
    info!(?reason, "Connection closed");
    Ok(())
}
