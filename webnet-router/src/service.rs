//! 推送服务与服务管理

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webnet::{encode_packet, Packet, Protocol, ProtocolHandler, SERVICE_FIELD, SUBSCRIBE, UNSUBSCRIBE};

/// 连接 ID
pub type ConnId = u64;

/// 连接的出站帧队列
pub type Outgoing = mpsc::UnboundedSender<String>;

/// 服务管理错误
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Service already registered: {0}")]
    ServiceAlreadyRegistered(String),
}

/// 推送服务
///
/// 向所有订阅者推送同一个包。启用历史记录时保留最近的若干帧，
/// 新订阅者会先收到这些帧。
pub struct PushService {
    name: String,
    history_len: usize,
    history: Mutex<VecDeque<String>>,
    subscribers: Mutex<HashMap<ConnId, Outgoing>>,
}

impl PushService {
    pub fn new(name: &str) -> Self {
        Self::with_history(name, 0)
    }

    /// 创建保留最近 `history_len` 帧的服务
    pub fn with_history(name: &str, history_len: usize) -> Self {
        Self {
            name: name.to_string(),
            history_len,
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 添加订阅者并回放历史，已订阅时返回 false
    pub fn subscribe(&self, id: ConnId, outgoing: Outgoing) -> bool {
        // 锁顺序与 push 一致：先 history 后 subscribers
        let history = self.history.lock();
        let mut subscribers = self.subscribers.lock();
        if subscribers.contains_key(&id) {
            return false;
        }
        for frame in history.iter() {
            if outgoing.send(frame.clone()).is_err() {
                return false;
            }
        }
        subscribers.insert(id, outgoing);
        true
    }

    pub fn unsubscribe(&self, id: ConnId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub fn is_subscribed(&self, id: ConnId) -> bool {
        self.subscribers.lock().contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// 推送包，返回送达的订阅者数量
    ///
    /// 出站队列已关闭的订阅者会被移除。
    pub fn push(&self, packet: &Packet) -> webnet::Result<usize> {
        let frame = encode_packet(packet)?;

        let mut history = self.history.lock();
        if self.history_len > 0 {
            if history.len() == self.history_len {
                history.pop_front();
            }
            history.push_back(frame.clone());
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, outgoing| {
            let delivered = outgoing.send(frame.clone()).is_ok();
            if !delivered {
                debug!("Dropping closed subscriber {} from {}", id, self.name);
            }
            delivered
        });
        Ok(subscribers.len())
    }

    /// 当前历史记录
    pub fn history(&self) -> Vec<String> {
        self.history.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for PushService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushService")
            .field("name", &self.name)
            .field("history_len", &self.history_len)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// 服务注册表，服务名不区分大小写
#[derive(Default)]
pub struct ServiceManager {
    services: RwLock<HashMap<String, Arc<PushService>>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务，同名（不区分大小写）服务已存在时失败
    pub fn register(&self, service: Arc<PushService>) -> Result<(), RouterError> {
        let key = service.name().to_lowercase();
        let mut services = self.services.write();
        if services.contains_key(&key) {
            return Err(RouterError::ServiceAlreadyRegistered(service.name().to_string()));
        }
        info!("Service {} registered", service.name());
        services.insert(key, service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PushService>> {
        self.services.read().get(&name.to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .services
            .read()
            .values()
            .map(|service| service.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// 订阅服务，未知服务名被忽略
    pub fn subscribe(&self, name: &str, id: ConnId, outgoing: Outgoing) -> bool {
        match self.get(name) {
            Some(service) => {
                let subscribed = service.subscribe(id, outgoing);
                if subscribed {
                    debug!("Connection {} subscribed to {}", id, service.name());
                }
                subscribed
            }
            None => {
                debug!("Connection {} asked for unknown service {}", id, name);
                false
            }
        }
    }

    pub fn unsubscribe(&self, name: &str, id: ConnId) -> bool {
        let unsubscribed = self
            .get(name)
            .is_some_and(|service| service.unsubscribe(id));
        if unsubscribed {
            debug!("Connection {} unsubscribed from {}", id, name);
        }
        unsubscribed
    }

    /// 连接关闭时退订所有服务
    pub fn unsubscribe_all(&self, id: ConnId) {
        for service in self.services.read().values() {
            service.unsubscribe(id);
        }
    }

    /// 为一个连接创建分发器，处理 subscribe/unsubscribe 控制包
    pub fn handler_for(
        self: &Arc<Self>,
        protocol: &Protocol,
        id: ConnId,
        outgoing: Outgoing,
    ) -> webnet::Result<ProtocolHandler> {
        let handler = ProtocolHandler::new(protocol.clone());

        let manager = Arc::clone(self);
        handler.register_handler(SUBSCRIBE, move |data, name| match service_name(data) {
            Some(service) => {
                manager.subscribe(service, id, outgoing.clone());
            }
            None => debug!("Connection {} sent {} without service name", id, name),
        })?;

        let manager = Arc::clone(self);
        handler.register_handler(UNSUBSCRIBE, move |data, name| match service_name(data) {
            Some(service) => {
                manager.unsubscribe(service, id);
            }
            None => debug!("Connection {} sent {} without service name", id, name),
        })?;

        Ok(handler)
    }
}

fn service_name(data: &Value) -> Option<&str> {
    data.get(SERVICE_FIELD).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use webnet::{decode_packet, service_payload, PacketHandler};

    fn packet(name: &str, data: Value) -> Packet {
        Packet::new(name, data).unwrap()
    }

    #[test]
    fn test_push_to_subscribers() {
        let service = PushService::new("clock");
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(service.subscribe(1, tx.clone()));
        assert!(!service.subscribe(1, tx));
        assert_eq!(service.push(&packet("clock", json!({"timestamp": 1}))).unwrap(), 1);

        let received = decode_packet(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(received.name(), "clock");
        assert_eq!(received.data(), &json!({"timestamp": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_dropped() {
        let service = PushService::new("clock");
        let (tx, rx) = mpsc::unbounded_channel();
        service.subscribe(1, tx);
        drop(rx);

        assert_eq!(service.push(&packet("clock", json!(null))).unwrap(), 0);
        assert_eq!(service.subscriber_count(), 0);
    }

    #[test]
    fn test_history_bounded_and_replayed() {
        let service = PushService::with_history("connections", 2);
        for count in 0..3 {
            service
                .push(&packet("connections", json!({"count": count})))
                .unwrap();
        }
        assert_eq!(service.history().len(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        service.subscribe(7, tx);
        let first = decode_packet(&rx.try_recv().unwrap()).unwrap();
        let second = decode_packet(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first.data(), &json!({"count": 1}));
        assert_eq!(second.data(), &json!({"count": 2}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_no_history_by_default() {
        let service = PushService::new("clock");
        service.push(&packet("clock", json!(1))).unwrap();
        assert!(service.history().is_empty());
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let manager = ServiceManager::new();
        manager.register(Arc::new(PushService::new("Clock"))).unwrap();

        let result = manager.register(Arc::new(PushService::new("clock")));
        assert!(matches!(result, Err(RouterError::ServiceAlreadyRegistered(name)) if name == "clock"));
        assert_eq!(manager.names(), vec!["Clock"]);
    }

    #[test]
    fn test_case_insensitive_subscribe() {
        let manager = ServiceManager::new();
        let service = Arc::new(PushService::new("clock"));
        manager.register(Arc::clone(&service)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(manager.subscribe("CLOCK", 1, tx.clone()));
        assert!(!manager.subscribe("weather", 1, tx));
        assert!(service.is_subscribed(1));
        assert!(manager.unsubscribe("Clock", 1));
        assert!(!service.is_subscribed(1));
    }

    #[test]
    fn test_unsubscribe_all() {
        let manager = ServiceManager::new();
        let clock = Arc::new(PushService::new("clock"));
        let connections = Arc::new(PushService::new("connections"));
        manager.register(Arc::clone(&clock)).unwrap();
        manager.register(Arc::clone(&connections)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.subscribe("clock", 1, tx.clone());
        manager.subscribe("connections", 1, tx.clone());
        manager.subscribe("clock", 2, tx);

        manager.unsubscribe_all(1);

        assert!(!clock.is_subscribed(1));
        assert!(!connections.is_subscribed(1));
        assert!(clock.is_subscribed(2));
    }

    #[test]
    fn test_handler_for_control_packets() {
        let manager = Arc::new(ServiceManager::new());
        let clock = Arc::new(PushService::new("clock"));
        manager.register(Arc::clone(&clock)).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = manager.handler_for(&Protocol::net(), 3, tx).unwrap();

        handler
            .handle(json!({"name": SUBSCRIBE, "data": service_payload("clock")}))
            .unwrap();
        assert!(clock.is_subscribed(3));

        // 缺少服务名的控制包被忽略
        handler.handle(json!({"name": UNSUBSCRIBE, "data": {}})).unwrap();
        assert!(clock.is_subscribed(3));

        handler
            .handle(json!({"name": UNSUBSCRIBE, "data": service_payload("clock")}))
            .unwrap();
        assert!(!clock.is_subscribed(3));
    }
}
