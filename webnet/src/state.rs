//! 连接就绪状态
//!
//! ```text
//!  CLOSED ──connect()──▶ CONNECTING ──open──▶ OPEN ──close()──▶ CLOSING
//!    ▲                        │                 │                  │
//!    └────────── close / error ┴─────────────────┴──────────────────┘
//! ```
//!
//! 状态由传输层报告，连接只做镜像。每次 `connect()` 都会创建新的传输实例，
//! 因此 `CLOSED` 既是初始状态也是每次尝试的终止状态。

use std::fmt;

/// 传输层就绪状态，数值与浏览器 WebSocket 的 `readyState` 一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    #[default]
    Closed = 3,
}

impl ReadyState {
    /// 数值编码
    pub fn code(self) -> u8 {
        self as u8
    }

    /// 从数值编码解析，未知编码返回 `None`
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Connecting),
            1 => Some(Self::Open),
            2 => Some(Self::Closing),
            3 => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
