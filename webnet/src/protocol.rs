//! 协议注册表
//!
//! 维护包名到包工厂的映射。`Protocol` 是一个共享句柄，克隆后指向同一张表，
//! 多个 `ProtocolHandler` 可以同时持有并扩展它。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::packet::{Packet, PacketFactory};
use crate::{RESERVED_PACKET_NAME, SERVICE_FIELD, SUBSCRIBE, UNSUBSCRIBE};

/// 包名注册表
#[derive(Clone, Default)]
pub struct Protocol {
    packets: Arc<RwLock<BTreeMap<String, PacketFactory>>>,
}

impl Protocol {
    /// 创建空的协议
    pub fn new() -> Self {
        Self::default()
    }

    /// 服务层使用的协议，预先注册 `subscribe` 和 `unsubscribe`
    pub fn net() -> Self {
        let protocol = Self::new();
        for name in [SUBSCRIBE, UNSUBSCRIBE] {
            // 常量包名必定合法
            let factory = PacketFactory::from_static(name);
            protocol.packets.write().insert(name.to_string(), factory);
        }
        protocol
    }

    /// 注册包名
    ///
    /// 空包名和保留字 `add` 会被拒绝。重复注册会覆盖原有工厂，
    /// 由于工厂只携带包名，覆盖前后行为一致。
    pub fn add(&self, name: &str) -> Result<PacketFactory> {
        if name == RESERVED_PACKET_NAME {
            return Err(ProtocolError::InvalidPacketName(name.to_string()));
        }
        let factory = Packet::bind_name(name)?;
        let previous = self
            .packets
            .write()
            .insert(name.to_string(), factory.clone());
        if previous.is_some() {
            debug!("Packet {} re-registered", name);
        }
        Ok(factory)
    }

    /// 是否已注册该包名
    pub fn contains(&self, name: &str) -> bool {
        self.packets.read().contains_key(name)
    }

    /// 获取包工厂
    pub fn get(&self, name: &str) -> Option<PacketFactory> {
        self.packets.read().get(name).cloned()
    }

    /// 使用已注册的工厂构造包
    pub fn packet(&self, name: &str, data: impl Into<Value>) -> Result<Packet> {
        self.get(name)
            .map(|factory| factory.create(data))
            .ok_or_else(|| ProtocolError::UnknownPacket(name.to_string()))
    }

    /// 所有已注册的包名（有序）
    pub fn names(&self) -> Vec<String> {
        self.packets.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.packets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.read().is_empty()
    }

    /// 是否与另一个句柄共享同一张注册表
    pub fn shares_registry_with(&self, other: &Protocol) -> bool {
        Arc::ptr_eq(&self.packets, &other.packets)
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("packets", &self.names())
            .finish()
    }
}

/// 构造 `subscribe`/`unsubscribe` 控制包的 data
pub fn service_payload(service: &str) -> Value {
    let mut data = serde_json::Map::new();
    data.insert(SERVICE_FIELD.to_string(), Value::String(service.to_string()));
    Value::Object(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_and_create() {
        let protocol = Protocol::new();
        let echo = protocol.add("echo").unwrap();
        assert!(protocol.contains("echo"));
        assert_eq!(echo.create("hi").data(), &json!("hi"));
        assert_eq!(protocol.packet("echo", 3).unwrap().data(), &json!(3));
    }

    #[test]
    fn test_reserved_name_rejected() {
        let protocol = Protocol::new();
        assert!(matches!(
            protocol.add("add"),
            Err(ProtocolError::InvalidPacketName(name)) if name == "add"
        ));
        assert!(!protocol.contains("add"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let protocol = Protocol::new();
        assert!(protocol.add("").is_err());
        assert!(protocol.is_empty());
    }

    #[test]
    fn test_re_register_overwrites() {
        let protocol = Protocol::new();
        protocol.add("ping").unwrap();
        protocol.add("ping").unwrap();
        assert_eq!(protocol.len(), 1);
    }

    #[test]
    fn test_unknown_packet() {
        let protocol = Protocol::new();
        assert!(matches!(
            protocol.packet("missing", Value::Null),
            Err(ProtocolError::UnknownPacket(_))
        ));
    }

    #[test]
    fn test_clone_shares_registry() {
        let protocol = Protocol::new();
        let other = protocol.clone();
        other.add("late").unwrap();
        assert!(protocol.contains("late"));
        assert!(protocol.shares_registry_with(&other));
        assert!(!protocol.shares_registry_with(&Protocol::new()));
    }

    #[test]
    fn test_net_protocol() {
        let protocol = Protocol::net();
        assert_eq!(protocol.names(), vec!["subscribe", "unsubscribe"]);
        let packet = protocol
            .packet(SUBSCRIBE, service_payload("clock"))
            .unwrap();
        assert_eq!(packet.data(), &json!({"service": "clock"}));
    }
}
