//! 命名服务订阅
//!
//! 服务是建立在连接之上的一层薄封装：通过 `subscribe`/`unsubscribe`
//! 控制包订阅或退订服务端推送，并携带该服务推送包的回调表。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::PacketSender;
use crate::error::{ProtocolError, Result};
use crate::handler::{Callback, ProtocolHandler};
use crate::packet::PacketFactory;
use crate::protocol::{service_payload, Protocol};
use crate::{SUBSCRIBE, UNSUBSCRIBE};

/// 命名服务
pub struct Service {
    name: String,
    subscribe: PacketFactory,
    unsubscribe: PacketFactory,
    handlers: BTreeMap<String, Callback>,
}

impl Service {
    /// 创建服务
    ///
    /// `protocol` 必须包含两个控制包（见 [`Protocol::net`]）；
    /// 回调表中任何一项为 `None` 都会导致失败。
    pub fn new<I, K>(name: &str, protocol: &Protocol, packets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Option<Callback>)>,
        K: Into<String>,
    {
        if name.is_empty() {
            return Err(ProtocolError::NameRequired);
        }

        let mut handlers = BTreeMap::new();
        for (packet, entry) in packets {
            let packet = packet.into();
            match entry {
                Some(callback) => {
                    handlers.insert(packet, callback);
                }
                None => return Err(ProtocolError::MalformedHandlerMap(packet)),
            }
        }

        let control = |packet: &str| {
            protocol
                .get(packet)
                .ok_or_else(|| ProtocolError::UnknownPacket(packet.to_string()))
        };

        Ok(Self {
            name: name.to_string(),
            subscribe: control(SUBSCRIBE)?,
            unsubscribe: control(UNSUBSCRIBE)?,
            handlers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handlers(&self) -> &BTreeMap<String, Callback> {
        &self.handlers
    }

    /// 回调表中的包名
    pub fn packets(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// 发送订阅控制包，返回是否已发送
    pub fn subscribe(&self, sender: &impl PacketSender) -> bool {
        sender.send_outbound(self.subscribe.create(service_payload(&self.name)).into())
    }

    /// 发送退订控制包，返回是否已发送
    pub fn unsubscribe(&self, sender: &impl PacketSender) -> bool {
        sender.send_outbound(self.unsubscribe.create(service_payload(&self.name)).into())
    }

    /// 把服务的回调注册到分发器
    pub fn register_into(&self, handler: &ProtocolHandler) -> Result<()> {
        handler.register_all(
            self.handlers
                .iter()
                .map(|(name, callback)| (name.clone(), Some(Arc::clone(callback)))),
        )
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("packets", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Outbound};
    use crate::handler::{callback, PacketHandler};
    use crate::state::ReadyState;
    use crate::testing::MockConnector;
    use crate::transport::{TransportEvent, TransportEventKind};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// 记录所有出站载荷
    #[derive(Default)]
    struct Captured(Mutex<Vec<Outbound>>);

    impl PacketSender for Captured {
        fn send_outbound(&self, payload: Outbound) -> bool {
            self.0.lock().push(payload);
            true
        }
    }

    fn clock_service() -> Service {
        Service::new(
            "clock",
            &Protocol::net(),
            [("clock", Some(callback(|_, _| {})))],
        )
        .unwrap()
    }

    #[test]
    fn test_name_required() {
        let result = Service::new("", &Protocol::net(), Vec::<(String, Option<Callback>)>::new());
        assert!(matches!(result, Err(ProtocolError::NameRequired)));
    }

    #[test]
    fn test_malformed_handler_map() {
        let result = Service::new(
            "clock",
            &Protocol::net(),
            [("clock", Some(callback(|_, _| {}))), ("tick", None)],
        );
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedHandlerMap(name)) if name == "tick"
        ));
    }

    #[test]
    fn test_requires_control_packets() {
        let result = Service::new("clock", &Protocol::new(), Vec::<(String, Option<Callback>)>::new());
        assert!(matches!(result, Err(ProtocolError::UnknownPacket(_))));
    }

    #[test]
    fn test_subscribe_packets() {
        let service = clock_service();
        let sender = Captured::default();
        assert!(service.subscribe(&sender));
        assert!(service.unsubscribe(&sender));

        let sent = sender.0.lock();
        let Outbound::Packet(subscribe) = &sent[0] else {
            panic!("expected packet");
        };
        assert_eq!(subscribe.name(), "subscribe");
        assert_eq!(subscribe.data(), &json!({"service": "clock"}));
        let Outbound::Packet(unsubscribe) = &sent[1] else {
            panic!("expected packet");
        };
        assert_eq!(unsubscribe.name(), "unsubscribe");
        assert_eq!(unsubscribe.data(), &json!({"service": "clock"}));
    }

    #[test]
    fn test_subscribe_over_connection() {
        let protocol = Protocol::net();
        let service = clock_service();
        let connector = MockConnector::default();
        let mut conn =
            Connection::new("ws://test", ProtocolHandler::new(protocol), connector.clone()).unwrap();

        // 未连接时不发送
        assert!(!service.subscribe(&conn));

        conn.connect().unwrap();
        let transport = connector.transport(0);
        transport.set_state(ReadyState::Open);
        conn.handle_event(TransportEvent {
            transport: Arc::clone(&transport),
            kind: TransportEventKind::Open,
        })
        .unwrap();

        assert!(service.subscribe(&conn));
        let frame: Value = serde_json::from_str(&transport.sent()[0]).unwrap();
        assert_eq!(frame, json!({"name": "subscribe", "data": {"service": "clock"}}));
    }

    #[test]
    fn test_register_into_handler() {
        let protocol = Protocol::net();
        let ticks = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&ticks);
        let service = Service::new(
            "clock",
            &protocol,
            [("clock", Some(callback(move |_, _| *counter.lock() += 1)))],
        )
        .unwrap();
        let handler = ProtocolHandler::new(protocol.clone());

        service.register_into(&handler).unwrap();
        handler.handle(json!({"name": "clock", "data": {"timestamp": 1}})).unwrap();

        assert!(protocol.contains("clock"));
        assert_eq!(*ticks.lock(), 1);
        assert_eq!(service.packets().collect::<Vec<_>>(), vec!["clock"]);
    }
}
