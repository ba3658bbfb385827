//! 协议常量定义

use std::time::Duration;

/// 保留包名，与协议注册方法同名
pub const RESERVED_PACKET_NAME: &str = "add";

/// 订阅服务的控制包
pub const SUBSCRIBE: &str = "subscribe";

/// 取消订阅服务的控制包
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// 控制包 data 中携带服务名的字段
pub const SERVICE_FIELD: &str = "service";

/// 默认服务地址
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080";

/// 默认监听地址
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// 文本帧最大大小
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// 服务端最大连接数
pub const MAX_CONNECTIONS: usize = 100;

/// 推送服务历史记录条数
pub const PUSH_HISTORY_LEN: usize = 100;

/// 推送间隔（秒）
pub const PUSH_INTERVAL_SECS: u64 = 1;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 推送间隔 Duration
pub const PUSH_INTERVAL: Duration = Duration::from_secs(PUSH_INTERVAL_SECS);

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
