//! ACK/NACK应答消息
//!
//! 应答沿用原消息的分隔符，交换发送方与接收方，MSA-2回填原控制ID。

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use hl7_core::utils::{format_hl7_timestamp, generate_control_id};
use serde::{Deserialize, Serialize};

use crate::delimiters::Delimiters;
use crate::message::{Message, Segment};
use crate::parser::Hl7Error;

/// 应答码(MSA-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckCode {
    /// AA / CA
    Accept,
    /// AE / CE
    Error,
    /// AR / CR
    Reject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "AA",
            Self::Error => "AE",
            Self::Reject => "AR",
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckCode {
    type Err = Hl7Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "AA" | "CA" => Ok(Self::Accept),
            "AE" | "CE" => Ok(Self::Error),
            "AR" | "CR" => Ok(Self::Reject),
            other => Err(Hl7Error::InvalidFormat(format!(
                "Unknown acknowledgement code: {}",
                other
            ))),
        }
    }
}

impl Message {
    /// 应答码(MSA-1)，非应答消息返回 `None`
    pub fn ack_code(&self) -> Option<AckCode> {
        self.find_segment("MSA")?.value(0).parse().ok()
    }

    /// 被应答消息的控制ID(MSA-2)
    pub fn acknowledged_control_id(&self) -> &str {
        self.find_segment("MSA").map(|msa| msa.value(1)).unwrap_or("")
    }

    /// 应答文本(MSA-3)
    pub fn ack_text(&self) -> &str {
        self.find_segment("MSA").map(|msa| msa.value(2)).unwrap_or("")
    }
}

/// 生成应答所需的消息头信息
struct HeaderInfo {
    delimiters: Delimiters,
    sending_application: String,
    sending_facility: String,
    receiving_application: String,
    receiving_facility: String,
    trigger_event: String,
    control_id: String,
    processing_id: String,
    version: String,
}

impl HeaderInfo {
    fn from_message(message: &Message) -> Self {
        Self {
            delimiters: *message.delimiters(),
            sending_application: message.sending_application().to_string(),
            sending_facility: message.sending_facility().to_string(),
            receiving_application: message.receiving_application().to_string(),
            receiving_facility: message.receiving_facility().to_string(),
            trigger_event: message.trigger_event().to_string(),
            control_id: message.control_id().to_string(),
            processing_id: message.processing_id().to_string(),
            version: message.version().to_string(),
        }
    }

    /// 尽力从无法解析的文本中提取MSH
    fn sniff(raw: &str) -> Self {
        let header = raw
            .split(|c| c == '\r' || c == '\n')
            .map(str::trim_start)
            .find(|line| line.starts_with("MSH"));

        let delimiters = header
            .and_then(|line| Delimiters::from_header(line, &Delimiters::default()).ok())
            .unwrap_or_default();

        match header {
            Some(line) if line.chars().nth(3) == Some(delimiters.field) => {
                let segment = Segment::parse(line, &delimiters);
                let field = |n: usize| segment.hl7_field(n).as_str().to_string();
                Self {
                    delimiters,
                    sending_application: field(3),
                    sending_facility: field(4),
                    receiving_application: field(5),
                    receiving_facility: field(6),
                    trigger_event: segment.hl7_field(9).component(1).as_str().to_string(),
                    control_id: field(10),
                    processing_id: field(11),
                    version: field(12),
                }
            }
            _ => Self {
                delimiters,
                sending_application: String::new(),
                sending_facility: String::new(),
                receiving_application: String::new(),
                receiving_facility: String::new(),
                trigger_event: String::new(),
                control_id: String::new(),
                processing_id: "P".to_string(),
                version: String::new(),
            },
        }
    }

    fn into_ack(self, code: AckCode, text: Option<&str>) -> Message {
        let d = self.delimiters;
        let f = d.field;
        let message_type = if self.trigger_event.is_empty() {
            "ACK".to_string()
        } else {
            format!("ACK{}{}", d.component, self.trigger_event)
        };

        let msh = format!(
            "MSH{f}{enc}{f}{ra}{f}{rf}{f}{sa}{f}{sf}{f}{ts}{f}{f}{ty}{f}{id}{f}{p}{f}{v}",
            enc = d.encoding_characters(),
            ra = self.receiving_application,
            rf = self.receiving_facility,
            sa = self.sending_application,
            sf = self.sending_facility,
            ts = format_hl7_timestamp(&Utc::now()),
            ty = message_type,
            id = generate_control_id(),
            p = self.processing_id,
            v = self.version,
        );

        let mut msa = format!("MSA{f}{}{f}{}", code.as_str(), self.control_id);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            msa.push(f);
            msa.push_str(&d.escape(text));
        }

        Message::from_parts(
            d,
            vec![Segment::parse(&msh, &d), Segment::parse(&msa, &d)],
            true,
        )
    }
}

/// 为已解析的消息生成应答
pub fn build_ack(original: &Message, code: AckCode, text: Option<&str>) -> Message {
    HeaderInfo::from_message(original).into_ack(code, text)
}

/// 为无法解析的原始文本生成否定应答，尽量回填原控制ID
pub fn build_nack_for_raw(raw: &str, code: AckCode, text: &str) -> Message {
    HeaderInfo::sniff(raw).into_ack(code, Some(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADT_A01: &str =
        "MSH|^~\\&|SENDAPP|SENDFAC|RECVAPP|RECVFAC|20230101120000||ADT^A01|MSG001|P|2.3\rPID|1||12345^^^MR\r";

    #[test]
    fn test_build_ack() {
        let original = Message::parse(ADT_A01).unwrap();
        let ack = build_ack(&original, AckCode::Accept, None);

        assert_eq!(ack.message_type(), "ACK^A01");
        assert_eq!(ack.sending_application(), "RECVAPP");
        assert_eq!(ack.receiving_facility(), "SENDFAC");
        assert_eq!(ack.version(), "2.3");
        assert_ne!(ack.control_id(), "MSG001");
        assert_eq!(ack.ack_code(), Some(AckCode::Accept));
        assert_eq!(ack.acknowledged_control_id(), "MSG001");
        assert_eq!(ack.ack_text(), "");

        let reparsed = Message::parse(&ack.to_string()).unwrap();
        assert_eq!(reparsed.to_string(), ack.to_string());
    }

    #[test]
    fn test_ack_text_is_escaped() {
        let original = Message::parse(ADT_A01).unwrap();
        let ack = build_ack(&original, AckCode::Error, Some("bad|field"));
        assert_eq!(ack.ack_text(), "bad\\F\\field");
        assert_eq!(ack.delimiters().unescape(ack.ack_text()), "bad|field");
    }

    #[test]
    fn test_ack_uses_original_delimiters() {
        let original = Message::parse("MSH#:*!$#A#B#C#D#20230101##ORU:R01#X9#P#2.5").unwrap();
        let ack = build_ack(&original, AckCode::Accept, None);
        assert!(ack.to_string().starts_with("MSH#:*!$#C#D#A#B#"));
        assert_eq!(ack.message_type(), "ACK:R01");
        assert_eq!(ack.acknowledged_control_id(), "X9");
    }

    #[test]
    fn test_nack_for_raw() {
        let raw = "MSH|^~\\&|APP|FAC|ENG|ENG|20230101||ORM^O01|CTRL42|P|2.4\r\u{0}";
        let nack = build_nack_for_raw(raw, AckCode::Error, "unparseable");
        assert_eq!(nack.acknowledged_control_id(), "CTRL42");
        assert_eq!(nack.message_type(), "ACK^O01");
        assert_eq!(nack.ack_code(), Some(AckCode::Error));

        let garbage = build_nack_for_raw("not hl7 at all", AckCode::Reject, "rejected");
        assert_eq!(garbage.acknowledged_control_id(), "");
        assert_eq!(garbage.message_type(), "ACK");
        assert_eq!(garbage.ack_text(), "rejected");
    }

    #[test]
    fn test_ack_code_parsing() {
        assert_eq!("CA".parse::<AckCode>().unwrap(), AckCode::Accept);
        assert_eq!("AE".parse::<AckCode>().unwrap(), AckCode::Error);
        assert_eq!(" CR ".parse::<AckCode>().unwrap(), AckCode::Reject);
        assert!("ZZ".parse::<AckCode>().is_err());
        assert!(Message::parse(ADT_A01).unwrap().ack_code().is_none());
    }
}
