//! # HL7集成引擎
//!
//! 从配置构建接口、统一订阅事件并管理启动与停止。
//! 引擎只负责投递解析后的消息，业务处理由订阅方完成。

pub mod config;
pub mod engine;
pub mod logging;

pub use config::{EngineConfig, InterfaceDefinition, LogFormat, LoggingConfig};
pub use engine::Engine;
