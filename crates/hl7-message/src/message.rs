//! HL7消息层次结构
//!
//! 位置约定：字段下标从0开始，计数不含段标识。`PID|1||12345` 中
//! 字段0为 `1`，字段2为 `12345`。MSH段的字段0是编码字符(MSH-2)，
//! 不做拆分。重复、组件、子组件下标同样从0开始。
//!
//! 需要HL7常规的1起始编号时使用 [`Message::value`]，例如 `"PID-3.1"`。

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::datetime::{parse_hl7_datetime, Hl7DateTime};
use crate::delimiters::Delimiters;
use crate::parser::{Hl7Error, Hl7Parser};

static EMPTY_COMPONENT: Component = Component {
    raw: String::new(),
    subcomponents: Vec::new(),
};

static EMPTY_REPETITION: Repetition = Repetition {
    raw: String::new(),
    components: Vec::new(),
};

static EMPTY_FIELD: Field = Field {
    raw: String::new(),
    repetitions: Vec::new(),
};

/// 组件，可包含子组件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    raw: String,
    subcomponents: Vec<String>,
}

impl Component {
    fn parse(raw: &str, delimiters: &Delimiters) -> Self {
        Self {
            raw: raw.to_string(),
            subcomponents: raw.split(delimiters.subcomponent).map(String::from).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// 第 `index` 个子组件，不存在时返回空串
    pub fn subcomponent(&self, index: usize) -> &str {
        self.subcomponents
            .get(index)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn subcomponents(&self) -> &[String] {
        &self.subcomponents
    }
}

/// 字段的一次重复
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repetition {
    raw: String,
    components: Vec<Component>,
}

impl Repetition {
    fn parse(raw: &str, delimiters: &Delimiters) -> Self {
        Self {
            raw: raw.to_string(),
            components: raw
                .split(delimiters.component)
                .map(|c| Component::parse(c, delimiters))
                .collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// 第 `index` 个组件，不存在时返回空组件
    pub fn component(&self, index: usize) -> &Component {
        self.components.get(index).unwrap_or(&EMPTY_COMPONENT)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }
}

/// 字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    raw: String,
    repetitions: Vec<Repetition>,
}

impl Field {
    pub(crate) fn parse(raw: &str, delimiters: &Delimiters) -> Self {
        Self {
            raw: raw.to_string(),
            repetitions: raw
                .split(delimiters.repetition)
                .map(|r| Repetition::parse(r, delimiters))
                .collect(),
        }
    }

    /// 不拆分的字段(MSH-2)
    fn literal(raw: &str) -> Self {
        let component = Component {
            raw: raw.to_string(),
            subcomponents: vec![raw.to_string()],
        };
        Self {
            raw: raw.to_string(),
            repetitions: vec![Repetition {
                raw: raw.to_string(),
                components: vec![component],
            }],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// 第 `index` 次重复，不存在时返回空重复
    pub fn repetition(&self, index: usize) -> &Repetition {
        self.repetitions.get(index).unwrap_or(&EMPTY_REPETITION)
    }

    pub fn repetitions(&self) -> &[Repetition] {
        &self.repetitions
    }

    pub fn repetition_count(&self) -> usize {
        self.repetitions.len()
    }

    /// 第一次重复中的第 `index` 个组件
    pub fn component(&self, index: usize) -> &Component {
        self.repetition(0).component(index)
    }

    /// 按HL7日期时间解析第一个组件，无法解析时返回 `None`
    pub fn as_datetime(&self) -> Option<Hl7DateTime> {
        parse_hl7_datetime(self.component(0).as_str())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// 段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    id: String,
    fields: Vec<Field>,
    #[serde(skip)]
    field_separator: char,
}

impl Segment {
    /// 解析一行段文本
    pub fn parse(line: &str, delimiters: &Delimiters) -> Self {
        let mut parts = line.split(delimiters.field);
        let id = parts.next().unwrap_or_default().to_string();

        let fields = if id == "MSH" {
            parts
                .enumerate()
                .map(|(i, raw)| {
                    if i == 0 {
                        Field::literal(raw)
                    } else {
                        Field::parse(raw, delimiters)
                    }
                })
                .collect()
        } else {
            parts.map(|raw| Field::parse(raw, delimiters)).collect()
        };

        Self {
            id,
            fields,
            field_separator: delimiters.field,
        }
    }

    /// 由字段文本构造段，用于协作方重建段
    pub fn from_values<S: AsRef<str>>(id: &str, values: &[S], delimiters: &Delimiters) -> Self {
        let mut line = id.to_string();
        for value in values {
            line.push(delimiters.field);
            line.push_str(value.as_ref());
        }
        Self::parse(&line, delimiters)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// 第 `index` 个字段(0起始，不含段标识)，不存在时返回空字段
    pub fn field(&self, index: usize) -> &Field {
        self.fields.get(index).unwrap_or(&EMPTY_FIELD)
    }

    /// 第 `index` 个字段的原始文本
    pub fn value(&self, index: usize) -> &str {
        self.field(index).as_str()
    }

    /// 按HL7编号(1起始)取字段，MSH-1不是字段，返回空字段
    pub fn hl7_field(&self, sequence: usize) -> &Field {
        let offset = if self.id == "MSH" { 2 } else { 1 };
        match sequence.checked_sub(offset) {
            Some(index) => self.field(index),
            None => &EMPTY_FIELD,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)?;
        for field in &self.fields {
            write!(f, "{}{}", self.field_separator, field.raw)?;
        }
        Ok(())
    }
}

/// HL7消息
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    delimiters: Delimiters,
    segments: Vec<Segment>,
    #[serde(skip)]
    index: HashMap<String, Vec<usize>>,
    #[serde(skip)]
    trailing_terminator: bool,
}

impl Message {
    /// 使用消息头声明的分隔符解析
    pub fn parse(raw: &str) -> Result<Self, Hl7Error> {
        Hl7Parser::new().parse(raw)
    }

    pub(crate) fn from_parts(
        delimiters: Delimiters,
        segments: Vec<Segment>,
        trailing_terminator: bool,
    ) -> Self {
        let mut message = Self {
            delimiters,
            segments,
            index: HashMap::new(),
            trailing_terminator,
        };
        message.rebuild_index();
        message
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (position, segment) in self.segments.iter().enumerate() {
            self.index
                .entry(segment.id.clone())
                .or_default()
                .push(position);
        }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, position: usize) -> Option<&Segment> {
        self.segments.get(position)
    }

    /// 消息头(MSH)，解析保证其存在
    pub fn header(&self) -> &Segment {
        &self.segments[0]
    }

    /// 第一个匹配的段
    pub fn find_segment(&self, id: &str) -> Option<&Segment> {
        self.index
            .get(id)
            .and_then(|positions| positions.first())
            .map(|&p| &self.segments[p])
    }

    /// 所有匹配的段，保持原始顺序
    pub fn find_segments(&self, id: &str) -> Vec<&Segment> {
        self.index
            .get(id)
            .map(|positions| positions.iter().map(|&p| &self.segments[p]).collect())
            .unwrap_or_default()
    }

    /// 消息类型(MSH-9)，如 `ADT^A01`
    pub fn message_type(&self) -> &str {
        self.header().hl7_field(9).as_str()
    }

    /// 消息代码(MSH-9.1)
    pub fn message_code(&self) -> &str {
        self.header().hl7_field(9).component(0).as_str()
    }

    /// 触发事件(MSH-9.2)
    pub fn trigger_event(&self) -> &str {
        self.header().hl7_field(9).component(1).as_str()
    }

    /// 消息控制ID(MSH-10)
    pub fn control_id(&self) -> &str {
        self.header().hl7_field(10).as_str()
    }

    /// 处理ID(MSH-11)
    pub fn processing_id(&self) -> &str {
        self.header().hl7_field(11).as_str()
    }

    /// 版本(MSH-12)
    pub fn version(&self) -> &str {
        self.header().hl7_field(12).as_str()
    }

    pub fn sending_application(&self) -> &str {
        self.header().hl7_field(3).as_str()
    }

    pub fn sending_facility(&self) -> &str {
        self.header().hl7_field(4).as_str()
    }

    pub fn receiving_application(&self) -> &str {
        self.header().hl7_field(5).as_str()
    }

    pub fn receiving_facility(&self) -> &str {
        self.header().hl7_field(6).as_str()
    }

    /// 消息时间(MSH-7)
    pub fn timestamp(&self) -> Option<Hl7DateTime> {
        self.header().hl7_field(7).as_datetime()
    }

    /// 按HL7常规记法取值：`SEG-F[.C[.S]]`，编号从1开始，取第一次重复
    ///
    /// 路径无效或位置不存在时返回空串。
    pub fn value(&self, path: &str) -> String {
        let Some((id, rest)) = path.split_once('-') else {
            return String::new();
        };
        let numbers: Option<Vec<usize>> = rest.split('.').map(|p| p.parse().ok()).collect();
        let Some(numbers) = numbers else {
            return String::new();
        };
        let Some(segment) = self.find_segment(id) else {
            return String::new();
        };

        match numbers.as_slice() {
            [1] if id == "MSH" => self.delimiters.field.to_string(),
            [field] => segment.hl7_field(*field).as_str().to_string(),
            [field, component] if *component > 0 => segment
                .hl7_field(*field)
                .component(component - 1)
                .as_str()
                .to_string(),
            [field, component, sub] if *component > 0 && *sub > 0 => segment
                .hl7_field(*field)
                .component(component - 1)
                .subcomponent(sub - 1)
                .to_string(),
            _ => String::new(),
        }
    }

    /// 追加段
    pub fn push_segment(&mut self, segment: Segment) {
        self.index
            .entry(segment.id.clone())
            .or_default()
            .push(self.segments.len());
        self.segments.push(segment);
    }

    /// 替换指定位置的段；位置无效或试图移除消息头时返回 `false`
    pub fn replace_segment(&mut self, position: usize, segment: Segment) -> bool {
        if position >= self.segments.len() || (position == 0 && segment.id != "MSH") {
            return false;
        }
        self.segments[position] = segment;
        self.rebuild_index();
        true
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("\r")?;
            }
            write!(f, "{}", segment)?;
        }
        if self.trailing_terminator {
            f.write_str("\r")?;
        }
        Ok(())
    }
}
