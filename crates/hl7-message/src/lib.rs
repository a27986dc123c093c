//! # HL7消息模型
//!
//! 将HL7 v2.x原始文本解析为可导航的层次结构：
//! 消息 → 段 → 字段 → 重复 → 组件 → 子组件。
//!
//! - 分隔符取自消息自身的MSH段
//! - 所有位置访问均为全函数：越界返回空值，从不panic
//! - 未修改的消息序列化后与原文逐字节一致

pub mod ack;
pub mod datetime;
pub mod delimiters;
pub mod message;
pub mod parser;

pub use ack::{build_ack, build_nack_for_raw, AckCode};
pub use datetime::{parse_hl7_datetime, DatePrecision, Hl7DateTime};
pub use delimiters::Delimiters;
pub use message::{Component, Field, Message, Repetition, Segment};
pub use parser::{Hl7Error, Hl7Parser};
