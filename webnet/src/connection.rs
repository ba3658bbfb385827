//! 连接封装
//!
//! `Connection` 同一时刻只拥有一个传输实例，负责连接、断开和发送，
//! 并把传输实例的就绪状态镜像给监听器。
//!
//! 每次 `connect()` 都会创建新的传输实例。旧实例的事件可能在新实例创建后才到达，
//! 因此所有状态通知都先检查事件来源是否仍是当前实例:
//! - open: 来自旧实例时直接关闭旧实例
//! - close: 状态通知受检查，关闭通知总会送达
//! - error: 状态通知受检查，之后总会关闭该实例
//! - message: 不做检查，总会解码并分发

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::codec::{decode_frame, encode_packet};
use crate::error::{ProtocolError, Result};
use crate::handler::{PacketHandler, ProtocolHandler};
use crate::packet::Packet;
use crate::state::ReadyState;
use crate::transport::{
    Connector, EventSink, Transport, TransportConfig, TransportEvent, TransportEventKind,
    WsConnector,
};

/// 出站载荷：包会被编码为 JSON，文本原样发送
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Packet(Packet),
    Text(String),
}

impl From<Packet> for Outbound {
    fn from(packet: Packet) -> Self {
        Outbound::Packet(packet)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Text(text.to_string())
    }
}

/// 能够发送出站载荷的对象
pub trait PacketSender {
    /// 仅在 OPEN 状态下发送，返回是否已交给传输层
    fn send_outbound(&self, payload: Outbound) -> bool;
}

/// 在传输实例上发送，非 OPEN 状态直接返回 false
fn send_on(transport: &dyn Transport, payload: Outbound) -> bool {
    if transport.ready_state() != ReadyState::Open {
        return false;
    }
    let frame = match payload {
        Outbound::Packet(packet) => match encode_packet(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode packet {}: {}", packet.name(), e);
                return false;
            }
        },
        Outbound::Text(text) => text,
    };
    match transport.send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send frame: {}", e);
            false
        }
    }
}

/// 监听器回调期间可用的发送端，绑定到触发事件的传输实例
pub struct Outbox<'a> {
    transport: &'a dyn Transport,
}

impl<'a> Outbox<'a> {
    fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }

    pub fn state(&self) -> ReadyState {
        self.transport.ready_state()
    }

    pub fn send(&self, payload: impl Into<Outbound>) -> bool {
        send_on(self.transport, payload.into())
    }
}

impl PacketSender for Outbox<'_> {
    fn send_outbound(&self, payload: Outbound) -> bool {
        send_on(self.transport, payload)
    }
}

/// 连接生命周期通知
///
/// 所有方法默认为空实现。返回的错误会被连接记录日志，不会中断事件处理；
/// 除 close 外，出错时连接还会关闭对应的传输实例。
pub trait ConnectionListener: Send {
    fn on_ready_state_change(&mut self, _state: ReadyState) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_open(&mut self, _outbox: &Outbox<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_close(&mut self, _code: Option<u16>, _reason: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&mut self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl ConnectionListener for () {}

/// 共享的当前传输实例
type CurrentTransport = Arc<RwLock<Option<Arc<dyn Transport>>>>;

/// 可克隆的发送端，总是发往连接的当前传输实例
///
/// 包回调可以捕获它来回复入站包；重连后自动指向新实例。
#[derive(Clone)]
pub struct ConnectionSender {
    current: CurrentTransport,
}

impl ConnectionSender {
    /// 当前传输实例的就绪状态，未连接过时为 CLOSED
    pub fn state(&self) -> ReadyState {
        self.current
            .read()
            .as_ref()
            .map_or(ReadyState::Closed, |transport| transport.ready_state())
    }

    pub fn send(&self, payload: impl Into<Outbound>) -> bool {
        self.send_outbound(payload.into())
    }
}

impl PacketSender for ConnectionSender {
    fn send_outbound(&self, payload: Outbound) -> bool {
        // 先克隆句柄再释放锁，发送期间不持有锁
        let transport = self.current.read().clone();
        match transport {
            Some(transport) => send_on(transport.as_ref(), payload),
            None => false,
        }
    }
}

impl std::fmt::Debug for ConnectionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSender")
            .field("state", &self.state())
            .finish()
    }
}

/// 单个持久连接
pub struct Connection<C: Connector, H: PacketHandler = ProtocolHandler> {
    url: String,
    handler: H,
    connector: C,
    listener: Box<dyn ConnectionListener>,
    transport: Option<Arc<C::Transport>>,
    current: CurrentTransport,
    events_tx: mpsc::UnboundedSender<TransportEvent<C::Transport>>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent<C::Transport>>,
}

impl<H: PacketHandler> Connection<WsConnector, H> {
    /// 使用 WebSocket 传输创建连接
    pub fn websocket(url: &str, handler: H, config: TransportConfig) -> Result<Self> {
        Self::new(url, handler, WsConnector::new(config))
    }
}

impl<C: Connector, H: PacketHandler> Connection<C, H> {
    /// 创建连接，此时尚未连接，状态为 CLOSED
    pub fn new(url: &str, handler: H, connector: C) -> Result<Self> {
        if url.is_empty() {
            return Err(ProtocolError::NoUrl);
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            url: url.to_string(),
            handler,
            connector,
            listener: Box::new(()),
            transport: None,
            current: Arc::new(RwLock::new(None)),
            events_tx,
            events_rx,
        })
    }

    /// 设置生命周期监听器
    pub fn with_listener(mut self, listener: impl ConnectionListener + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    pub fn set_listener(&mut self, listener: impl ConnectionListener + 'static) {
        self.listener = Box::new(listener);
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// 创建可在包回调中使用的发送端
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            current: Arc::clone(&self.current),
        }
    }

    /// 当前传输实例的就绪状态，未连接过时为 CLOSED
    pub fn state(&self) -> ReadyState {
        self.transport
            .as_ref()
            .map_or(ReadyState::Closed, |transport| transport.ready_state())
    }

    /// 建立连接，仅在 CLOSED 状态下生效
    ///
    /// 创建传输实例失败时返回错误；初始状态通知失败时关闭新实例并记录日志。
    pub fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state != ReadyState::Closed {
            debug!("connect() ignored, {} is {}", self.url, state);
            return Ok(());
        }

        let transport = self
            .connector
            .open(&self.url, EventSink::new(self.events_tx.clone()))?;
        self.transport = Some(Arc::clone(&transport));
        let shared: Arc<dyn Transport> = transport.clone();
        *self.current.write() = Some(shared);
        debug!("Opened new transport for {}", self.url);

        if let Err(e) = self.ready_state_changed(&transport) {
            transport.close();
            error!("Ready state listener failed while connecting to {}: {:#}", self.url, e);
        }
        Ok(())
    }

    /// 关闭当前传输实例；未连接或已关闭时无效果
    pub fn disconnect(&mut self) {
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }

    /// 发送载荷，仅在 OPEN 状态下成功；不排队
    pub fn send(&self, payload: impl Into<Outbound>) -> bool {
        self.send_outbound(payload.into())
    }

    /// 等待下一个传输事件，不做处理
    pub async fn next_event(&mut self) -> Option<TransportEvent<C::Transport>> {
        self.events_rx.recv().await
    }

    /// 等待并处理下一个传输事件
    ///
    /// 返回入站消息分发产生的错误，生命周期通知的错误只记录日志。
    pub async fn process_next(&mut self) -> Result<()> {
        match self.next_event().await {
            Some(event) => self.handle_event(event),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// 处理一个传输事件
    pub fn handle_event(&mut self, event: TransportEvent<C::Transport>) -> Result<()> {
        let TransportEvent { transport, kind } = event;
        match kind {
            TransportEventKind::Open => {
                if !self.is_current(&transport) {
                    debug!("Closing stale transport for {}", self.url);
                    transport.close();
                    return Ok(());
                }
                let result = match self.ready_state_changed(&transport) {
                    Ok(()) => self.listener.on_open(&Outbox::new(transport.as_ref())),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    transport.close();
                    error!("Open listener failed for {}: {:#}", self.url, e);
                }
                Ok(())
            }
            TransportEventKind::Message(text) => {
                if !self.is_current(&transport) {
                    debug!("Dispatching message from stale transport for {}", self.url);
                }
                let message = decode_frame(&text)?;
                self.handler.handle(message)
            }
            TransportEventKind::Close { code, reason } => {
                let result = match self.ready_state_changed(&transport) {
                    Ok(()) => self.listener.on_close(code, &reason),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Close listener failed for {}: {:#}", self.url, e);
                }
                Ok(())
            }
            TransportEventKind::Error(message) => {
                let result = match self.ready_state_changed(&transport) {
                    Ok(()) => self.listener.on_error(&message),
                    Err(e) => Err(e),
                };
                transport.close();
                if let Err(e) = result {
                    error!("Error listener failed for {}: {:#}", self.url, e);
                }
                Ok(())
            }
        }
    }

    fn is_current(&self, transport: &Arc<C::Transport>) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, transport))
    }

    /// 仅当 `transport` 仍是当前实例时通知状态变化
    fn ready_state_changed(&mut self, transport: &Arc<C::Transport>) -> anyhow::Result<()> {
        if self.is_current(transport) {
            let state = transport.ready_state();
            debug!("{} is {}", self.url, state);
            self.listener.on_ready_state_change(state)?;
        }
        Ok(())
    }
}

impl<C: Connector, H: PacketHandler> PacketSender for Connection<C, H> {
    fn send_outbound(&self, payload: Outbound) -> bool {
        match &self.transport {
            Some(transport) => send_on(transport.as_ref(), payload),
            None => false,
        }
    }
}

impl<C: Connector, H: PacketHandler> Drop for Connection<C, H> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
