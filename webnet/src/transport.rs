//! 传输层抽象
//!
//! 连接不直接依赖具体的 socket 实现，只通过 [`Connector`] 创建传输实例，
//! 再通过 [`Transport`] 读取就绪状态、发送文本帧和关闭。
//! 每个传输实例通过 [`EventSink`] 上报自己的生命周期事件，事件携带实例句柄，
//! 连接据此判断事件是否来自当前传输。
//!
//! [`WsConnector`] 是基于 tokio-tungstenite 的 WebSocket 实现。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::state::ReadyState;
use crate::{CONNECT_TIMEOUT, MAX_FRAME_SIZE};

/// 传输层配置
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 握手超时时间，`None` 表示一直等待
    pub connect_timeout: Option<Duration>,
    /// 单个文本帧的最大字节数
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(CONNECT_TIMEOUT),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// 传输实例上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// 连接已建立
    Open,
    /// 收到文本帧
    Message(String),
    /// 连接已关闭
    Close { code: Option<u16>, reason: String },
    /// 连接出错
    Error(String),
}

/// 带有来源实例的传输事件
pub struct TransportEvent<T> {
    pub transport: Arc<T>,
    pub kind: TransportEventKind,
}

impl<T> std::fmt::Debug for TransportEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvent")
            .field("transport", &Arc::as_ptr(&self.transport))
            .field("kind", &self.kind)
            .finish()
    }
}

/// 传输实例上报事件的通道
pub struct EventSink<T> {
    tx: mpsc::UnboundedSender<TransportEvent<T>>,
}

impl<T> EventSink<T> {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent<T>>) -> Self {
        Self { tx }
    }

    /// 上报事件，接收端已释放时返回 false
    pub fn emit(&self, transport: &Arc<T>, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                transport: Arc::clone(transport),
                kind,
            })
            .is_ok()
    }
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// 单个传输实例
pub trait Transport: Send + Sync + 'static {
    /// 当前就绪状态
    fn ready_state(&self) -> ReadyState;

    /// 发送一个文本帧
    fn send(&self, frame: String) -> Result<()>;

    /// 请求关闭，可重复调用；连接中的实例会中止握手
    fn close(&self);
}

/// 传输实例工厂，每次调用都创建一个新实例
pub trait Connector: Send + Sync {
    type Transport: Transport;

    /// 创建绑定到 `url` 的新传输实例，事件通过 `events` 上报
    fn open(&self, url: &str, events: EventSink<Self::Transport>)
        -> Result<Arc<Self::Transport>>;
}

// ============================================================================
// WebSocket 实现
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 发给 socket 任务的命令
#[derive(Debug)]
enum Command {
    Send(String),
    Close,
}

/// WebSocket 传输工厂
#[derive(Clone, Debug, Default)]
pub struct WsConnector {
    config: TransportConfig,
}

impl WsConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    /// 需要在 tokio 运行时中调用；地址不合法时立即返回错误
    fn open(&self, url: &str, events: EventSink<WsTransport>) -> Result<Arc<WsTransport>> {
        let request = url.into_client_request()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WsTransport {
            url: url.to_string(),
            state: AtomicU8::new(ReadyState::Connecting.code()),
            max_frame_size: self.config.max_frame_size,
            commands: tx,
        });

        tokio::spawn(run_socket(
            Arc::clone(&transport),
            request,
            self.config.clone(),
            rx,
            events,
        ));

        Ok(transport)
    }
}

/// WebSocket 传输实例
#[derive(Debug)]
pub struct WsTransport {
    url: String,
    state: AtomicU8,
    max_frame_size: usize,
    commands: mpsc::UnboundedSender<Command>,
}

impl WsTransport {
    pub fn url(&self) -> &str {
        &self.url
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state.code(), Ordering::SeqCst);
    }

    /// 仅当仍处于 CONNECTING 时切换为 OPEN
    fn try_open(&self) -> bool {
        self.state
            .compare_exchange(
                ReadyState::Connecting.code(),
                ReadyState::Open.code(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl Transport for WsTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_code(self.state.load(Ordering::SeqCst)).unwrap_or(ReadyState::Closed)
    }

    fn send(&self, frame: String) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(ProtocolError::ConnectionClosed);
        }
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        self.commands
            .send(Command::Send(frame))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(&self) {
        let closing = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |code| {
                match ReadyState::from_code(code) {
                    Some(ReadyState::Connecting) | Some(ReadyState::Open) => {
                        Some(ReadyState::Closing.code())
                    }
                    _ => None,
                }
            })
            .is_ok();
        if closing {
            let _ = self.commands.send(Command::Close);
        }
    }
}

/// 带超时的握手
async fn handshake(request: Request, config: &TransportConfig) -> Result<WsStream> {
    let connecting = connect_async(request);
    let (ws, _) = match config.connect_timeout {
        Some(limit) => timeout(limit, connecting)
            .await
            .map_err(|_| ProtocolError::ConnectionTimeout)??,
        None => connecting.await?,
    };
    Ok(ws)
}

/// 等待关闭命令；握手期间不会有待发送的帧
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, Command::Close) {
            return;
        }
    }
}

/// socket 任务：握手、收发帧，结束时上报关闭事件
async fn run_socket(
    transport: Arc<WsTransport>,
    request: Request,
    config: TransportConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSink<WsTransport>,
) {
    let url = transport.url().to_string();

    let connected = tokio::select! {
        result = handshake(request, &config) => Some(result),
        _ = wait_for_close(&mut commands) => None,
    };

    let ws = match connected {
        Some(Ok(ws)) => ws,
        Some(Err(e)) => {
            warn!("Failed to connect to {}: {}", url, e);
            transport.set_state(ReadyState::Closed);
            events.emit(&transport, TransportEventKind::Error(e.to_string()));
            events.emit(
                &transport,
                TransportEventKind::Close {
                    code: None,
                    reason: e.to_string(),
                },
            );
            return;
        }
        None => {
            debug!("Connect to {} aborted", url);
            transport.set_state(ReadyState::Closed);
            events.emit(
                &transport,
                TransportEventKind::Close {
                    code: None,
                    reason: "aborted".to_string(),
                },
            );
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    // close() 可能在握手完成的同时被调用
    let mut closing = !transport.try_open();
    if closing {
        let _ = sink.send(Message::Close(None)).await;
    } else {
        info!("Connected to {}", url);
        events.emit(&transport, TransportEventKind::Open);
    }

    let mut failure: Option<String> = None;
    let mut close_frame: (Option<u16>, String) = (None, String::new());

    loop {
        tokio::select! {
            command = commands.recv(), if !closing => {
                match command {
                    Some(Command::Send(text)) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            failure = Some(e.to_string());
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        transport.set_state(ReadyState::Closing);
                        closing = true;
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Failed to send close frame: {}", e);
                            break;
                        }
                    }
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str().to_owned();
                        if text.len() > config.max_frame_size {
                            warn!("Dropping oversized frame ({} bytes) from {}", text.len(), url);
                            continue;
                        }
                        if !events.emit(&transport, TransportEventKind::Message(text)) && !closing {
                            transport.set_state(ReadyState::Closing);
                            closing = true;
                            let _ = sink.send(Message::Close(None)).await;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring binary frame ({} bytes) from {}", data.len(), url);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            close_frame = (Some(u16::from(frame.code)), frame.reason.as_str().to_owned());
                        }
                        transport.set_state(ReadyState::Closing);
                        let _ = sink.close().await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if closing {
                            debug!("Socket error while closing {}: {}", url, e);
                        } else {
                            failure = Some(e.to_string());
                        }
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    transport.set_state(ReadyState::Closed);
    info!("Disconnected from {}", url);

    if let Some(message) = failure {
        warn!("Socket error on {}: {}", url, message);
        events.emit(&transport, TransportEventKind::Error(message));
    }
    let (code, reason) = close_frame;
    events.emit(&transport, TransportEventKind::Close { code, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    /// 启动一个回显服务，返回 ws 地址
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                // 关闭帧由 tungstenite 自动回复
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });
        format!("ws://{}", addr)
    }

    async fn next_kind(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent<WsTransport>>,
    ) -> TransportEventKind {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().kind
    }

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.connect_timeout, Some(CONNECT_TIMEOUT));
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = WsConnector::default();
        assert!(connector.open("not a url", EventSink::new(tx)).is_err());
    }

    #[tokio::test]
    async fn test_ws_echo_roundtrip() {
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = WsConnector::default();
        let transport = connector.open(&url, EventSink::new(tx)).unwrap();

        assert_eq!(transport.ready_state(), ReadyState::Connecting);
        assert!(transport.send("early".to_string()).is_err());

        assert_eq!(next_kind(&mut rx).await, TransportEventKind::Open);
        assert_eq!(transport.ready_state(), ReadyState::Open);

        transport.send(r#"{"name":"echo","data":1}"#.to_string()).unwrap();
        assert_eq!(
            next_kind(&mut rx).await,
            TransportEventKind::Message(r#"{"name":"echo","data":1}"#.to_string())
        );

        transport.close();
        assert_eq!(transport.ready_state(), ReadyState::Closing);
        assert!(matches!(
            next_kind(&mut rx).await,
            TransportEventKind::Close { .. }
        ));
        assert_eq!(transport.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_close() {
        // 绑定后立即释放，得到一个无人监听的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = WsConnector::default();
        let transport = connector
            .open(&format!("ws://{}", addr), EventSink::new(tx))
            .unwrap();

        assert!(matches!(next_kind(&mut rx).await, TransportEventKind::Error(_)));
        assert!(matches!(
            next_kind(&mut rx).await,
            TransportEventKind::Close { .. }
        ));
        assert_eq!(transport.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let url = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = WsConnector::new(TransportConfig {
            connect_timeout: None,
            max_frame_size: 8,
        });
        let transport = connector.open(&url, EventSink::new(tx)).unwrap();
        assert_eq!(next_kind(&mut rx).await, TransportEventKind::Open);

        assert!(matches!(
            transport.send("0123456789".to_string()),
            Err(ProtocolError::FrameTooLarge { size: 10, max: 8 })
        ));
        transport.close();
    }
}
