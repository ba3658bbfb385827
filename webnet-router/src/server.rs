//! 路由服务器核心实现

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use webnet::{decode_packet, PacketFactory, Protocol, ProtocolHandler, PUSH_HISTORY_LEN};

use crate::service::{ConnId, PushService, ServiceManager};

/// 时钟服务名，同时也是推送包名
pub const CLOCK_SERVICE: &str = "clock";

/// 连接数服务名，同时也是推送包名
pub const CONNECTIONS_SERVICE: &str = "connections";

/// 关闭时等待连接退出的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// 服务器配置
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub max_connections: usize,
    pub push_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_connections: webnet::MAX_CONNECTIONS,
            push_interval: webnet::PUSH_INTERVAL,
        }
    }
}

/// 共享状态
struct SharedState {
    protocol: Protocol,
    services: Arc<ServiceManager>,
    max_connections: usize,
    /// 当前连接数
    connection_count: AtomicUsize,
    /// 下一个连接 ID
    next_conn_id: AtomicU64,
}

impl SharedState {
    /// 增加连接数，如果超过限制则返回 false
    fn try_add_connection(&self) -> bool {
        self.connection_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .is_ok()
    }

    fn remove_connection(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn online_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }
}

/// 路由服务器
pub struct Router {
    state: Arc<SharedState>,
    config: RouterConfig,
    clock: PacketFactory,
    connections: PacketFactory,
    /// 关闭信号发送端
    shutdown_tx: watch::Sender<bool>,
    /// 关闭信号接收端（用于克隆给连接处理器）
    shutdown_rx: watch::Receiver<bool>,
}

impl Router {
    /// 创建服务器并注册内置服务
    pub fn new(config: RouterConfig) -> anyhow::Result<Self> {
        let protocol = Protocol::net();
        let clock = protocol.add(CLOCK_SERVICE)?;
        let connections = protocol.add(CONNECTIONS_SERVICE)?;

        let services = Arc::new(ServiceManager::new());
        services.register(Arc::new(PushService::new(CLOCK_SERVICE)))?;
        services.register(Arc::new(PushService::with_history(
            CONNECTIONS_SERVICE,
            PUSH_HISTORY_LEN,
        )))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            state: Arc::new(SharedState {
                protocol,
                services,
                max_connections: config.max_connections,
                connection_count: AtomicUsize::new(0),
                next_conn_id: AtomicU64::new(1),
            }),
            config,
            clock,
            connections,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.state.services
    }

    pub fn protocol(&self) -> &Protocol {
        &self.state.protocol
    }

    pub fn online_count(&self) -> usize {
        self.state.online_count()
    }

    /// 绑定地址并运行，直到收到 Ctrl+C
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// 在已绑定的监听器上运行，`shutdown` 完成时执行 graceful shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        info!("Router listening on {}", listener.local_addr()?);
        self.spawn_pushers();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // 接受新连接
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                _ = &mut shutdown => {
                    info!("Received shutdown signal, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
            }
        }

        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        // 检查连接数限制
        if !self.state.try_add_connection() {
            warn!("Connection limit reached, rejecting {}", addr);
            tokio::spawn(reject(stream));
            return;
        }

        let id = self.state.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, id, Arc::clone(&state), shutdown_rx).await {
                debug!("Connection {} ({}) error: {}", id, addr, e);
            }
            state.services.unsubscribe_all(id);
            state.remove_connection();
            info!("Connection {} ({}) closed", id, addr);
        });
    }

    /// 启动内置服务的定时推送
    fn spawn_pushers(&self) {
        let services = &self.state.services;

        if let Some(clock) = services.get(CLOCK_SERVICE) {
            let factory = self.clock.clone();
            self.spawn_pusher(clock, move || {
                factory.create(json!({ "timestamp": timestamp_millis() }))
            });
        }

        if let Some(connections) = services.get(CONNECTIONS_SERVICE) {
            let factory = self.connections.clone();
            let state = Arc::clone(&self.state);
            self.spawn_pusher(connections, move || {
                factory.create(json!({
                    "timestamp": timestamp_millis(),
                    "count": state.online_count(),
                }))
            });
        }
    }

    fn spawn_pusher<F>(&self, service: Arc<PushService>, make_packet: F)
    where
        F: Fn() -> webnet::Packet + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = interval(self.config.push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = service.push(&make_packet()) {
                            warn!("Failed to push {}: {}", service.name(), e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Pusher for {} stopped", service.name());
                        break;
                    }
                }
            }
        });
    }

    /// 执行 graceful shutdown
    async fn shutdown(&self) {
        // 发送关闭信号
        let _ = self.shutdown_tx.send(true);

        // 等待所有连接断开
        let start = Instant::now();
        while self.state.online_count() > 0 {
            if start.elapsed() > SHUTDOWN_TIMEOUT {
                warn!(
                    "Shutdown timeout, {} connections still active",
                    self.state.online_count()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("Router shutdown complete");
    }
}

fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 完成握手后立即以 1013 关闭
async fn reject(stream: TcpStream) {
    match accept_async(stream).await {
        Ok(mut ws) => {
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "server busy".into(),
            };
            if let Err(e) = ws.close(Some(frame)).await {
                debug!("Failed to reject connection: {}", e);
            }
        }
        Err(e) => debug!("Handshake failed for rejected connection: {}", e),
    }
}

/// 处理单个 WebSocket 连接
async fn handle_connection(
    stream: TcpStream,
    id: ConnId,
    state: Arc<SharedState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    info!("Connection {} opened", id);

    let (mut writer, mut reader) = ws.split();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
    let handler = state
        .services
        .handler_for(&state.protocol, id, outgoing)?;

    loop {
        tokio::select! {
            // 接收客户端帧
            message = reader.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => dispatch(&handler, id, text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Connection {} sent {} binary bytes, ignored", id, data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Connection {} sent close frame: {:?}", id, frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Error receiving from connection {}: {}", id, e);
                        break;
                    }
                    None => break,
                }
            }

            // 推送给客户端
            frame = outgoing_rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(e) = writer.send(Message::text(frame)).await {
                    debug!("Failed to send to connection {}: {}", id, e);
                    break;
                }
            }

            // 监听 shutdown 信号
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received for connection {}", id);
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: "server shutting down".into(),
                    };
                    writer.send(Message::Close(Some(frame))).await?;
                    break;
                }
            }
        }
    }

    Ok(())
}

/// 解码并分发一帧，失败时只记录日志，连接保持
fn dispatch(handler: &ProtocolHandler, id: ConnId, text: &str) {
    let result = decode_packet(text).and_then(|packet| handler.handle_packet(&packet));
    if let Err(e) = result {
        debug!("Connection {} sent undecodable frame: {}", id, e);
    }
}
