//! 包分发
//!
//! `ProtocolHandler` 把入站包按包名分发给注册的回调。
//! 处理器持有协议的共享句柄，注册未知包名时会自动扩展协议，
//! 因此处理器表中的每个包名也一定存在于协议中。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::protocol::Protocol;

/// 包回调，参数为 `(data, name)`
///
/// 回调需要发包时可以捕获 [`ConnectionSender`](crate::ConnectionSender)。
pub type Callback = Arc<dyn Fn(&Value, &str) + Send + Sync>;

/// 把闭包包装为 [`Callback`]
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Value, &str) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 入站包的分发能力
///
/// `Connection` 只依赖这一个操作，任何实现它的类型都可以接收解码后的帧。
pub trait PacketHandler: Send + Sync {
    /// 处理一个解码后的入站消息
    fn handle(&self, message: Value) -> Result<()>;
}

/// 基于协议的包分发器
pub struct ProtocolHandler {
    protocol: Protocol,
    handlers: RwLock<HashMap<String, Callback>>,
}

impl ProtocolHandler {
    /// 创建分发器，协议中已有的包名都会预置一个空回调
    pub fn new(protocol: Protocol) -> Self {
        let noop = callback(|_, _| {});
        let handlers = protocol
            .names()
            .into_iter()
            .map(|name| (name, Arc::clone(&noop)))
            .collect();
        Self {
            protocol,
            handlers: RwLock::new(handlers),
        }
    }

    /// 创建分发器并注册一组回调
    pub fn with_handlers<I, K>(protocol: Protocol, handlers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Option<Callback>)>,
        K: Into<String>,
    {
        let handler = Self::new(protocol);
        handler.register_all(handlers)?;
        Ok(handler)
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// 注册回调，包名不在协议中时自动注册到协议；重复注册会覆盖
    pub fn register_handler<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        self.register_callback(name, callback(f))
    }

    /// 注册已包装好的回调
    pub fn register_callback(&self, name: &str, callback: Callback) -> Result<()> {
        if !self.protocol.contains(name) {
            self.protocol.add(name)?;
            debug!("Packet {} auto-registered", name);
        }
        self.handlers.write().insert(name.to_string(), callback);
        Ok(())
    }

    /// 注册处理器表中的一项；`None` 表示该条目不可调用
    pub fn register_entry(&self, name: &str, entry: Option<Callback>) -> Result<()> {
        match entry {
            Some(callback) => self.register_callback(name, callback),
            None => Err(ProtocolError::NotAFunction(name.to_string())),
        }
    }

    /// 注册表中所有可调用的条目，跳过 `None`
    pub fn register_all<I, K>(&self, handlers: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Option<Callback>)>,
        K: Into<String>,
    {
        for (name, entry) in handlers {
            let name = name.into();
            match entry {
                Some(callback) => self.register_callback(&name, callback)?,
                None => debug!("Skipping non-callable handler for {}", name),
            }
        }
        Ok(())
    }

    /// 是否为该包名注册了回调
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// 分发一个已构造的包
    pub fn handle_packet(&self, packet: &Packet) -> Result<()> {
        self.dispatch(packet.name(), packet.data())
    }

    fn dispatch(&self, name: &str, data: &Value) -> Result<()> {
        // 先克隆回调再释放锁，回调内部可以继续注册
        let callback = self
            .handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProtocolError::HandlerNotFound(name.to_string()))?;
        callback(data, name);
        Ok(())
    }
}

impl PacketHandler for ProtocolHandler {
    fn handle(&self, message: Value) -> Result<()> {
        let name = match message.get("name") {
            Some(Value::String(name)) => name.as_str(),
            _ => return Err(ProtocolError::MalformedPacket),
        };
        let data = message.get("data").unwrap_or(&Value::Null);
        self.dispatch(name, data)
    }
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ProtocolHandler")
            .field("protocol", &self.protocol)
            .field("handlers", &names)
            .finish()
    }
}
