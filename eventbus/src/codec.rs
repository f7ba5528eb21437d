//! 信封与消息之间的转换
//!
//! 消息体由 `EventSerializer` 产生；重试次数与事件 ID 放在消息头中。
//!
use eventbus_broker::Message;
use eventbus_domain::{DomainResult, EventEnvelope, EventSerializer};

use crate::headers;

pub(crate) fn encode(
    serializer: &dyn EventSerializer,
    envelope: &EventEnvelope,
) -> DomainResult<Message> {
    let event = envelope.event();
    let body = serializer.to_bytes(event)?;
    Ok(Message::builder()
        .routing_key(event.routing_key())
        .body(body)
        .message_id(event.event_id().to_string())
        .build()
        .with_header(headers::RETRY_COUNT, envelope.retry_count())
        .with_header(headers::EVENT_ID, event.event_id().to_string()))
}

pub(crate) fn decode(
    serializer: &dyn EventSerializer,
    message: &Message,
) -> DomainResult<EventEnvelope> {
    let event = serializer.from_bytes(message.body())?;
    Ok(EventEnvelope::with_retry_count(event, retry_count(message)))
}

/// 缺失或非法的重试次数按 0 处理
pub(crate) fn retry_count(message: &Message) -> u32 {
    message
        .header_int(headers::RETRY_COUNT)
        .and_then(|count| u32::try_from(count).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventbus_domain::{Event, JsonEventSerializer};

    #[test]
    fn envelope_survives_the_wire() {
        let event = Event::new("mailbox.added", b"payload".to_vec());
        let envelope = EventEnvelope::with_retry_count(event.clone(), 2);

        let message = encode(&JsonEventSerializer, &envelope).unwrap();
        assert_eq!(message.routing_key(), "mailbox.added");
        assert_eq!(message.message_id(), Some(event.event_id().to_string().as_str()));

        let decoded = decode(&JsonEventSerializer, &message).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn negative_retry_count_reads_as_zero() {
        let message = Message::builder()
            .routing_key("k")
            .build()
            .with_header(headers::RETRY_COUNT, -3i64);

        assert_eq!(retry_count(&message), 0);
    }

    #[test]
    fn garbage_body_fails_to_decode() {
        let message = Message::builder()
            .routing_key("k")
            .body(b"not an event".to_vec())
            .build();

        assert!(decode(&JsonEventSerializer, &message).is_err());
    }
}
