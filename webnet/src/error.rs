//! 错误类型定义

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON 编解码错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket 传输错误
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// 包名为空或为保留字
    #[error("Invalid packet name: {0:?}")]
    InvalidPacketName(String),

    /// 包处理器不可调用
    #[error("Handler for {0} is not a function")]
    NotAFunction(String),

    /// 入站帧缺少字符串类型的 name 字段
    #[error("Malformed packet")]
    MalformedPacket,

    /// 没有为该包名注册处理器
    #[error("Handler for {0} not found")]
    HandlerNotFound(String),

    /// 协议中不存在该包
    #[error("Packet {0} is not in protocol")]
    UnknownPacket(String),

    /// 服务名为空
    #[error("Service name required")]
    NameRequired,

    /// 服务的处理器表中存在不可调用的条目
    #[error("Malformed packet handler map: {0}")]
    MalformedHandlerMap(String),

    /// 连接地址为空
    #[error("No url")]
    NoUrl,

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
