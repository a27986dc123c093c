//! 通用工具函数

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// HL7控制ID最大长度 (MSH-10, ST 20)
pub const MAX_CONTROL_ID_LEN: usize = 20;

/// 生成唯一的消息控制ID
pub fn generate_control_id() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(MAX_CONTROL_ID_LEN)
        .collect()
}

/// 格式化为HL7时间戳 (YYYYMMDDHHMMSS)
pub fn format_hl7_timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S").to_string()
}

/// 截断日志中的消息内容
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars()
        .take(max_chars)
        .map(|c| if c == '\r' { '\n' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_control_id() {
        let id = generate_control_id();
        assert_eq!(id.len(), MAX_CONTROL_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_control_id());
    }

    #[test]
    fn test_format_hl7_timestamp() {
        let time = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 5).unwrap();
        assert_eq!(format_hl7_timestamp(&time), "20230101120005");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("MSH|^~\\&\rPID", 5), "MSH|^");
        assert_eq!(preview("A\rB", 10), "A\nB");
    }
}
