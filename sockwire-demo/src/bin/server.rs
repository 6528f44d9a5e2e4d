//! 演示服务端
//!
//! 对每个 `Say` 回复 `Echo`，原始包中的通知写入日志。

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sockwire::{Listener, TlsServerConfig, TransportConfig, DEFAULT_BUFFER_SIZE};
use sockwire_demo::{server_registry, DEFAULT_ADDR};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sockwire-server", about = "Echo server for the sockwire demo")]
struct Args {
    /// 监听地址
    #[arg(long, default_value = DEFAULT_ADDR)]
    bind: String,

    /// 读写及套接字缓冲区大小（字节）
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// PEM 证书链，与 --key 一起启用 TLS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM 私钥
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sockwire_server=debug".parse()?)
                .add_directive("sockwire_demo=debug".parse()?)
                .add_directive("sockwire=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = TransportConfig::default().with_buffer_size(args.buffer_size);
    let registry = server_registry();

    let listener = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            info!(addr = %args.bind, "Demo server starting with TLS");
            Listener::start_tls(&args.bind, &config, &TlsServerConfig::new(cert, key), registry)
                .await?
        }
        _ => {
            info!(addr = %args.bind, "Demo server starting");
            Listener::start(&args.bind, &config, registry).await?
        }
    };
    info!(local_addr = %listener.local_addr(), "Server listening");

    listener
        .run_until(async {
            // 监听 Ctrl+C 信号
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
