//! 包类型定义
//!
//! `Packet` 是一个不可变的 `{name, data}` 信封。
//! 包工厂提供两种预绑定方式:
//! - [`Packet::bind_name`] 只绑定包名，构造时再提供 data
//! - [`Packet::bind_name_and_data`] 同时绑定包名和 data，构造时无需参数

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// 命名消息信封
///
/// 反序列化同样经过 [`Packet::new`]，空包名会被拒绝。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawPacket<T>")]
pub struct Packet<T = Value> {
    name: String,
    data: T,
}

/// 未校验的反序列化结果
#[derive(Deserialize)]
struct RawPacket<T> {
    name: String,
    data: T,
}

impl<T> TryFrom<RawPacket<T>> for Packet<T> {
    type Error = ProtocolError;

    fn try_from(raw: RawPacket<T>) -> Result<Self> {
        Packet::new(raw.name, raw.data)
    }
}

impl<T> Packet<T> {
    /// 创建包，包名不能为空
    pub fn new(name: impl Into<String>, data: T) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidPacketName(name));
        }
        Ok(Self { name, data })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// 拆分为包名和 data
    pub fn into_parts(self) -> (String, T) {
        (self.name, self.data)
    }
}

impl Packet<Value> {
    /// 只绑定包名的工厂
    pub fn bind_name(name: impl Into<String>) -> Result<PacketFactory> {
        PacketFactory::new(name)
    }

    /// 同时绑定包名和 data 的工厂
    pub fn bind_name_and_data(name: impl Into<String>, data: Value) -> Result<BoundPacket> {
        Ok(PacketFactory::new(name)?.bind(data))
    }
}

/// 只绑定了包名的工厂，每次构造时传入 data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFactory {
    name: String,
}

impl PacketFactory {
    fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidPacketName(name));
        }
        Ok(Self { name })
    }

    pub(crate) fn from_static(name: &'static str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 构造一个携带 `data` 的包
    pub fn create(&self, data: impl Into<Value>) -> Packet {
        Packet {
            name: self.name.clone(),
            data: data.into(),
        }
    }

    /// 进一步绑定 data
    pub fn bind(&self, data: impl Into<Value>) -> BoundPacket {
        BoundPacket {
            name: self.name.clone(),
            data: data.into(),
        }
    }
}

/// 包名和 data 都已绑定的工厂
#[derive(Debug, Clone, PartialEq)]
pub struct BoundPacket {
    name: String,
    data: Value,
}

impl BoundPacket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 构造包，每次返回相同的 data
    pub fn create(&self) -> Packet {
        Packet {
            name: self.name.clone(),
            data: self.data.clone(),
        }
    }
}
