//! 宽松的HL7日期时间解析
//!
//! 支持 `YYYY[MM[DD[HH[MM[SS[.S[S[S[S]]]]]]]]][+/-ZZZZ]`。
//! 无法解析的输入返回 `None`，不会让整条消息失败。

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

/// 时间精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

/// 解析后的HL7日期时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hl7DateTime {
    /// 本地时间，缺失部分补为起始值
    pub naive: NaiveDateTime,
    /// 显式声明的时区偏移
    pub offset: Option<FixedOffset>,
    pub precision: DatePrecision,
}

impl Hl7DateTime {
    pub fn date(&self) -> NaiveDate {
        self.naive.date()
    }

    /// 转换为UTC；未声明时区时按UTC处理
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self.offset {
            Some(offset) => offset
                .from_local_datetime(&self.naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&self.naive)),
            None => Utc.from_utc_datetime(&self.naive),
        }
    }
}

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4})(\d{2})?(\d{2})?(\d{2})?(\d{2})?(\d{2})?(?:\.(\d{1,4}))?([+-]\d{4})?$",
        )
        .expect("HL7 datetime pattern is valid")
    })
}

/// 解析HL7日期时间
pub fn parse_hl7_datetime(value: &str) -> Option<Hl7DateTime> {
    let caps = pattern().captures(value.trim())?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let parts = [number(2), number(3), number(4), number(5), number(6)];

    let precision = match parts.iter().take_while(|p| p.is_some()).count() {
        0 => DatePrecision::Year,
        1 => DatePrecision::Month,
        2 => DatePrecision::Day,
        3 => DatePrecision::Hour,
        4 => DatePrecision::Minute,
        _ => DatePrecision::Second,
    };

    let fraction = caps.get(7).map(|m| m.as_str());
    if fraction.is_some() && precision != DatePrecision::Second {
        return None;
    }
    let nanos = match fraction {
        Some(digits) => format!("{:0<9}", digits).parse::<u32>().ok()?,
        None => 0,
    };

    let date = NaiveDate::from_ymd_opt(year, parts[0].unwrap_or(1), parts[1].unwrap_or(1))?;
    let time = NaiveTime::from_hms_nano_opt(
        parts[2].unwrap_or(0),
        parts[3].unwrap_or(0),
        parts[4].unwrap_or(0),
        nanos,
    )?;

    let offset = match caps.get(8) {
        Some(m) => Some(parse_offset(m.as_str())?),
        None => None,
    };

    Some(Hl7DateTime {
        naive: NaiveDateTime::new(date, time),
        offset,
        precision,
    })
}

fn parse_offset(value: &str) -> Option<FixedOffset> {
    let sign = if value.starts_with('-') { -1 } else { 1 };
    let hours: i32 = value.get(1..3)?.parse().ok()?;
    let minutes: i32 = value.get(3..5)?.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
