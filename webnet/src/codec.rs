//! 帧编解码
//!
//! 帧格式为 WebSocket 文本帧，内容是一个 JSON 对象:
//! ```text
//! {"name": "<包名>", "data": <任意 JSON>}
//! ```

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::MAX_FRAME_SIZE;

/// 把包编码为文本帧
pub fn encode_packet(packet: &Packet) -> Result<String> {
    let text = serde_json::to_string(packet)?;
    check_size(text.len())?;
    Ok(text)
}

/// 把文本帧解码为 JSON 值，不校验包结构
pub fn decode_frame(text: &str) -> Result<Value> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

/// 把文本帧解码为包
///
/// `name` 必须是非空字符串；缺少 `data` 时视为 `null`。
pub fn decode_packet(text: &str) -> Result<Packet> {
    let value = decode_frame(text)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::MalformedPacket);
    };
    let name = match object.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => return Err(ProtocolError::MalformedPacket),
    };
    let data = object.remove("data").unwrap_or(Value::Null);
    Packet::new(name, data)
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equality::json_equals;
    use serde_json::json;

    #[test]
    fn test_encode_packet_shape() {
        let packet = Packet::new("echo", json!({"text": "hi"})).unwrap();
        let text = encode_packet(&packet).unwrap();
        let value = decode_frame(&text).unwrap();
        assert!(json_equals(
            &value,
            &json!({"data": {"text": "hi"}, "name": "echo"})
        ));
    }

    #[test]
    fn test_decode_packet() {
        let packet = decode_packet(r#"{"name":"clock","data":{"timestamp":5}}"#).unwrap();
        assert_eq!(packet.name(), "clock");
        assert_eq!(packet.data(), &json!({"timestamp": 5}));
    }

    #[test]
    fn test_decode_packet_without_data() {
        let packet = decode_packet(r#"{"name":"ping"}"#).unwrap();
        assert_eq!(packet.data(), &Value::Null);
    }

    #[test]
    fn test_decode_packet_malformed() {
        for text in [r#"{"data":1}"#, r#"{"name":3}"#, r#"{"name":""}"#, "[1,2]"] {
            assert!(matches!(
                decode_packet(text),
                Err(ProtocolError::MalformedPacket)
            ));
        }
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(decode_frame("{not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let big = format!("\"{}\"", "a".repeat(MAX_FRAME_SIZE));
        assert!(matches!(
            decode_frame(&big),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        let packet = Packet::new("blob", json!("a".repeat(MAX_FRAME_SIZE))).unwrap();
        assert!(matches!(
            encode_packet(&packet),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
