//! # MLLP帧编解码
//!
//! 最小下层协议(Minimal Lower Layer Protocol)：
//! `0x0B <HL7消息> 0x1C 0x0D`。

pub mod codec;

pub use codec::{FramingError, MllpCodec, MllpFrame, Scan};
