//! 事件序列化（EventSerializer）
//!
//! 序列化格式属于外部协作方的关注点，这里只定义协议与默认的 JSON 实现。
//! 反序列化失败视为不可恢复：运行时会把消息直接送入死信队列。
//!
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::DomainResult;
use crate::event::{Event, EventId};

pub trait EventSerializer: Send + Sync {
    fn to_bytes(&self, event: &Event) -> DomainResult<Vec<u8>>;

    fn from_bytes(&self, bytes: &[u8]) -> DomainResult<Event>;
}

/// 默认 JSON 序列化：载荷以 base64 字符串保存
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

#[derive(Serialize, Deserialize)]
struct WireEvent {
    event_id: EventId,
    routing_key: String,
    payload: String,
}

impl EventSerializer for JsonEventSerializer {
    fn to_bytes(&self, event: &Event) -> DomainResult<Vec<u8>> {
        let wire = WireEvent {
            event_id: event.event_id(),
            routing_key: event.routing_key().to_string(),
            payload: STANDARD.encode(event.payload()),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> DomainResult<Event> {
        let wire: WireEvent = serde_json::from_slice(bytes)?;
        let payload = STANDARD.decode(wire.payload)?;

        Ok(Event::builder()
            .event_id(wire.event_id)
            .routing_key(wire.routing_key)
            .payload(payload)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;

    #[test]
    fn preserves_binary_payload() {
        let event = Event::new("mailbox.added", vec![0u8, 159, 146, 150, 255]);
        let bytes = JsonEventSerializer.to_bytes(&event).unwrap();
        assert_eq!(JsonEventSerializer.from_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn malformed_input_is_an_error() {
        let err = JsonEventSerializer.from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, DomainError::Serde { .. }));

        let bad_payload = br#"{"event_id":"6f1c3a62-3f0e-4f5e-9a55-0b0c2d4e6f70","routing_key":"k","payload":"%%%"}"#;
        let err = JsonEventSerializer.from_bytes(bad_payload).unwrap_err();
        assert!(matches!(err, DomainError::Parse { .. }));
    }
}
