//! HL7解析器
//!
//! 容错解析：忽略首尾空白与空行，接受 `\r`、`\n`、`\r\n` 作为段结束符，
//! 缺失的可选字段通过全函数访问器返回空值。

use thiserror::Error;
use tracing::debug;

use crate::delimiters::Delimiters;
use crate::message::{Message, Segment};

const BYTE_ORDER_MARK: char = '\u{FEFF}';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Hl7Error {
    #[error("Invalid HL7 message format: {0}")]
    InvalidFormat(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid delimiters: {0}")]
    InvalidDelimiters(String),
}

impl From<Hl7Error> for hl7_core::EngineError {
    fn from(error: Hl7Error) -> Self {
        hl7_core::EngineError::Parse(error.to_string())
    }
}

/// HL7解析器
#[derive(Debug, Clone, Default)]
pub struct Hl7Parser {
    fallback: Delimiters,
}

impl Hl7Parser {
    /// 创建新的HL7解析器
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定消息头缺省编码字符时使用的分隔符
    pub fn with_delimiters(fallback: Delimiters) -> Self {
        Self { fallback }
    }

    /// 解析HL7消息
    pub fn parse(&self, raw: &str) -> Result<Message, Hl7Error> {
        let start_trimmed = raw.strip_prefix(BYTE_ORDER_MARK).unwrap_or(raw).trim_start();
        let body = trim_trailing_lines(start_trimmed);
        if body.is_empty() {
            return Err(Hl7Error::InvalidFormat("Empty message".to_string()));
        }
        let trailing_terminator = body.len() < start_trimmed.len();

        let mut lines = body
            .split(|c| c == '\r' || c == '\n')
            .filter(|line| !line.trim().is_empty());

        let header = lines
            .next()
            .ok_or_else(|| Hl7Error::InvalidFormat("Empty message".to_string()))?;
        if !header.starts_with("MSH") {
            return Err(Hl7Error::InvalidFormat(
                "Message must start with MSH segment".to_string(),
            ));
        }

        let delimiters = Delimiters::from_header(header, &self.fallback)?;
        let mut segments = vec![Segment::parse(header, &delimiters)];
        segments.extend(lines.map(|line| Segment::parse(line, &delimiters)));

        debug!(segments = segments.len(), "Parsed HL7 message");
        Ok(Message::from_parts(delimiters, segments, trailing_terminator))
    }
}

/// 去掉末尾的段结束符与空白行，保留最后一段的原文
fn trim_trailing_lines(text: &str) -> &str {
    let is_terminator = |c: char| c == '\r' || c == '\n';
    let mut body = text;
    loop {
        let trimmed = body.trim_end_matches(is_terminator);
        match trimmed.rfind(is_terminator) {
            Some(position) if trimmed[position + 1..].trim().is_empty() => {
                body = &trimmed[..=position];
            }
            _ => return trimmed,
        }
    }
}
