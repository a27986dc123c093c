//! 入站应答策略

use hl7_message::{build_ack, build_nack_for_raw, AckCode, Hl7Error, Message};

/// 决定入站消息的ACK/NACK内容，返回 `None` 表示不回复
pub trait AckPolicy: Send + Sync {
    /// 已成功解析并投递的消息
    fn acknowledge(&self, message: &Message) -> Option<Message> {
        Some(build_ack(message, AckCode::Accept, None))
    }

    /// 无法解析的原始文本
    fn reject(&self, raw: &str, error: &Hl7Error) -> Option<Message> {
        Some(build_nack_for_raw(raw, AckCode::Error, &error.to_string()))
    }
}

/// 默认策略：解析成功回复AA，解析失败回复AE
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAccept;

impl AckPolicy for AlwaysAccept {}
