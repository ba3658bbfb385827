//! 推送路由客户端
//!
//! 连接到路由服务端，订阅服务并打印收到的包

mod client;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use client::Client;
use tracing_subscriber::EnvFilter;
use webnet::{TransportConfig, CONNECT_TIMEOUT_SECS, DEFAULT_URL};

#[derive(Parser, Debug)]
#[command(version, about = "WebSocket push client")]
struct Args {
    /// 服务端地址
    #[arg(default_value = DEFAULT_URL)]
    url: String,

    /// 连接后订阅的服务，可重复
    #[arg(short, long = "service")]
    services: Vec<String>,

    /// 握手超时（秒），0 表示不超时
    #[arg(long, default_value_t = CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("webnet_client=info".parse()?)
                .add_directive("webnet=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = TransportConfig {
        connect_timeout: (args.connect_timeout > 0).then(|| Duration::from_secs(args.connect_timeout)),
        ..TransportConfig::default()
    };

    let mut client = Client::new(&args.url, &args.services, config)?;
    client.run().await
}
