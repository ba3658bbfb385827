//! 客户端包协议与连接生命周期库
//!
//! 包含:
//! - 结构相等判断 (equals)
//! - 包与包工厂 (Packet, PacketFactory, BoundPacket)
//! - 协议注册表 (Protocol)
//! - 包分发 (ProtocolHandler)
//! - 传输层抽象与 WebSocket 实现 (Transport, Connector, WsConnector)
//! - 连接状态机 (Connection)
//! - 命名服务订阅 (Service)

mod constants;
mod error;
mod codec;
mod equality;
mod packet;
mod protocol;
mod handler;
mod state;
mod transport;
mod connection;
mod service;

#[cfg(test)]
mod testing;

pub use constants::*;
pub use error::{ProtocolError, Result};
pub use codec::{decode_frame, decode_packet, encode_packet};
pub use equality::{equals, json_equals, Node, NodeKind};
pub use packet::{BoundPacket, Packet, PacketFactory};
pub use protocol::{service_payload, Protocol};
pub use handler::{callback, Callback, PacketHandler, ProtocolHandler};
pub use state::ReadyState;
pub use transport::{
    Connector, EventSink, Transport, TransportConfig, TransportEvent, TransportEventKind,
    WsConnector, WsTransport,
};
pub use connection::{
    Connection, ConnectionListener, ConnectionSender, Outbound, Outbox, PacketSender,
};
pub use service::Service;
