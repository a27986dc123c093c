//! HL7分隔符
//!
//! 分隔符由消息头MSH段声明：MSH-1为字段分隔符，MSH-2依次为
//! 组件、重复、转义、子组件分隔符。仅当消息头缺省时才使用默认值。

use serde::{Deserialize, Serialize};

use crate::parser::Hl7Error;

/// 消息分隔符集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// 从MSH段首行读取分隔符，缺省的编码字符取自 `fallback`
    pub fn from_header(line: &str, fallback: &Delimiters) -> Result<Self, Hl7Error> {
        let mut chars = line.chars().skip(3);
        let field = chars
            .next()
            .ok_or_else(|| Hl7Error::MissingField("Field separator (MSH-1)".to_string()))?;

        let encoding: Vec<char> = chars.take_while(|c| *c != field).collect();
        let delimiters = Self {
            field,
            component: encoding.first().copied().unwrap_or(fallback.component),
            repetition: encoding.get(1).copied().unwrap_or(fallback.repetition),
            escape: encoding.get(2).copied().unwrap_or(fallback.escape),
            subcomponent: encoding.get(3).copied().unwrap_or(fallback.subcomponent),
        };
        delimiters.validate()?;
        Ok(delimiters)
    }

    /// MSH-2 编码字符
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    fn validate(&self) -> Result<(), Hl7Error> {
        let all = [
            self.field,
            self.component,
            self.repetition,
            self.escape,
            self.subcomponent,
        ];
        for (i, c) in all.iter().enumerate() {
            if c.is_alphanumeric() || *c == '\r' || *c == '\n' {
                return Err(Hl7Error::InvalidDelimiters(format!(
                    "'{}' cannot be used as a delimiter",
                    c.escape_default()
                )));
            }
            if all[i + 1..].contains(c) {
                return Err(Hl7Error::InvalidDelimiters(format!(
                    "'{}' is declared more than once",
                    c.escape_default()
                )));
            }
        }
        Ok(())
    }

    /// 将文本中的分隔符替换为HL7转义序列
    pub fn escape(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            let code = if c == self.escape {
                Some('E')
            } else if c == self.field {
                Some('F')
            } else if c == self.component {
                Some('S')
            } else if c == self.subcomponent {
                Some('T')
            } else if c == self.repetition {
                Some('R')
            } else {
                None
            };

            match code {
                Some(code) => {
                    out.push(self.escape);
                    out.push(code);
                    out.push(self.escape);
                }
                None => out.push(c),
            }
        }
        out
    }

    /// 还原HL7转义序列；无法识别的序列原样保留
    pub fn unescape(&self, text: &str) -> String {
        if !text.contains(self.escape) {
            return text.to_string();
        }

        let width = self.escape.len_utf8();
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(self.escape) {
            out.push_str(&rest[..start]);
            let after = &rest[start + width..];
            match after.find(self.escape) {
                Some(end) => {
                    let sequence = &after[..end];
                    match self.decode_sequence(sequence) {
                        Some(decoded) => out.push_str(&decoded),
                        None => {
                            out.push(self.escape);
                            out.push_str(sequence);
                            out.push(self.escape);
                        }
                    }
                    rest = &after[end + width..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn decode_sequence(&self, sequence: &str) -> Option<String> {
        match sequence {
            "F" => Some(self.field.to_string()),
            "S" => Some(self.component.to_string()),
            "T" => Some(self.subcomponent.to_string()),
            "R" => Some(self.repetition.to_string()),
            "E" => Some(self.escape.to_string()),
            _ => {
                let hex = sequence.strip_prefix('X')?;
                if hex.is_empty() || hex.len() % 2 != 0 {
                    return None;
                }
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
                    .collect::<Option<Vec<u8>>>()?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }
}
