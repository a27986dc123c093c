//! 错误定义模块

use thiserror::Error;

/// HL7引擎统一错误类型
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("MLLP帧错误: {0}")]
    Framing(String),

    #[error("HL7解析错误: {0}")]
    Parse(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("操作超时: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("消息被拒绝: 控制ID={control_id}, 应答码={code}, {text}")]
    Rejected {
        control_id: String,
        code: String,
        text: String,
    },

    #[error("消息投递失败: 已尝试 {attempts} 次, 最后错误: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl EngineError {
    /// 是否为启动阶段的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }

    /// 对端正常关闭或重置连接
    pub fn is_connection_closed(&self) -> bool {
        match self {
            EngineError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// HL7引擎统一结果类型
pub type Result<T> = std::result::Result<T, EngineError>;
