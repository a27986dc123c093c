//! 引擎配置
//!
//! 从配置文件(TOML/YAML/JSON)加载，并可通过 `HL7_ENGINE__*` 环境变量覆盖。

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use hl7_core::EngineError;
use hl7_interface::{FileSystemInboundConfig, SocketInboundConfig, SocketOutboundConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "HL7_ENGINE";

/// 引擎完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 日志配置
    pub logging: LoggingConfig,
    /// 接口定义，按顺序启动
    pub interfaces: Vec<InterfaceDefinition>,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或过滤指令，例如 `info,hl7_interface=debug`
    pub level: String,
    pub format: LogFormat,
    /// 是否输出模块路径
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
            with_target: true,
        }
    }
}

/// 接口定义
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterfaceDefinition {
    SocketInbound(SocketInboundConfig),
    SocketOutbound(SocketOutboundConfig),
    FileSystemInbound(FileSystemInboundConfig),
}

impl InterfaceDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::SocketInbound(config) => &config.name,
            Self::SocketOutbound(config) => &config.name,
            Self::FileSystemInbound(config) => &config.name,
        }
    }

    pub fn validate(&self) -> hl7_core::Result<()> {
        match self {
            Self::SocketInbound(config) => config.validate(),
            Self::SocketOutbound(config) => config.validate(),
            Self::FileSystemInbound(config) => config.validate(),
        }
    }
}

impl EngineConfig {
    /// 从文件加载配置，环境变量优先
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate().context("Invalid configuration")?;

        info!(
            path = %path.display(),
            interfaces = config.interfaces.len(),
            "Configuration loaded successfully"
        );
        Ok(config)
    }

    /// 从TOML文本加载配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;

        let config: EngineConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// 校验所有接口配置，接口名称必须唯一
    pub fn validate(&self) -> hl7_core::Result<()> {
        let mut names = HashSet::new();
        for definition in &self.interfaces {
            definition.validate()?;
            if !names.insert(definition.name()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate interface name: {}",
                    definition.name()
                )));
            }
        }
        Ok(())
    }
}
