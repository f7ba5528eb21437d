//! 总线写入的消息头

/// 当前重试次数（首次投递为 0）
pub const RETRY_COUNT: &str = "x-retry-count";
pub const EVENT_ID: &str = "x-event-id";
/// 死信来源的消费组
pub const DEAD_LETTER_GROUP: &str = "x-dead-letter-group";
pub const FAILURE_REASON: &str = "x-failure-reason";
/// RFC 3339 时间戳
pub const DEAD_LETTERED_AT: &str = "x-dead-lettered-at";
