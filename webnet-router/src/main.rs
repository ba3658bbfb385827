//! 推送路由服务端
//!
//! 接受 WebSocket 连接，处理 subscribe/unsubscribe 控制包，
//! 定时向订阅者推送内置服务的数据

mod server;
mod service;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use server::{Router, RouterConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use webnet::{DEFAULT_LISTEN_ADDR, MAX_CONNECTIONS, PUSH_INTERVAL_SECS};

#[derive(Parser, Debug)]
#[command(version, about = "WebSocket push router")]
struct Args {
    /// 监听地址
    #[arg(default_value = DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// 最大连接数
    #[arg(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,

    /// 推送间隔（毫秒）
    #[arg(long, default_value_t = PUSH_INTERVAL_SECS * 1000)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("webnet_router=debug".parse()?)
                .add_directive("webnet=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Router starting on {}", args.addr);

    let router = Router::new(RouterConfig {
        max_connections: args.max_connections,
        push_interval: Duration::from_millis(args.interval_ms.max(1)),
    })?;
    info!(
        "Services: {:?}, packets: {:?}",
        router.services().names(),
        router.protocol().names()
    );
    router.run(&args.addr).await?;
    info!("Router stopped with {} connections left", router.online_count());

    Ok(())
}
