//! 接口配置
//!
//! 时间类配置以毫秒表示，便于从TOML/环境变量加载。

use std::path::PathBuf;
use std::time::Duration;

use hl7_core::{EngineError, Result};
use hl7_mllp::codec::DEFAULT_MAX_FRAME_LENGTH;
use serde::{Deserialize, Serialize};

const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(EngineError::Configuration(
            "interface name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// MLLP入站监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketInboundConfig {
    /// 接口名称
    pub name: String,
    /// 监听地址
    pub bind_address: String,
    /// 监听端口，0表示由系统分配
    pub port: u16,
    /// 是否回复ACK/NACK
    pub send_acknowledgements: bool,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 最大帧长度(字节)
    pub max_frame_length: usize,
    /// 停止时等待处理中连接的时间
    pub shutdown_timeout_ms: u64,
}

impl Default for SocketInboundConfig {
    fn default() -> Self {
        Self {
            name: "Inbound Socket".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 2575,
            send_acknowledgements: true,
            max_connections: 100,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SocketInboundConfig {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        if self.bind_address.trim().is_empty() {
            return Err(EngineError::Configuration(format!(
                "{}: bind address must not be empty",
                self.name
            )));
        }
        if self.max_connections == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: max_connections must be at least 1",
                self.name
            )));
        }
        if self.max_frame_length == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: max_frame_length must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// MLLP出站发送配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOutboundConfig {
    pub name: String,
    /// 对端主机
    pub host: String,
    /// 对端端口
    pub port: u16,
    /// 单条消息失败后的最大重试次数
    pub max_retries: u32,
    /// 首次重试等待时间，之后每次加倍
    pub retry_backoff_ms: u64,
    /// 重试等待上限
    pub max_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    /// 等待对端ACK的时间
    pub ack_timeout_ms: u64,
    pub max_frame_length: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for SocketOutboundConfig {
    fn default() -> Self {
        Self {
            name: "Outbound Socket".to_string(),
            host: "127.0.0.1".to_string(),
            port: 2575,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            connect_timeout_ms: 5_000,
            ack_timeout_ms: 30_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SocketOutboundConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// 第 `attempt` 次失败后的等待时间(指数退避)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms)
            .saturating_mul(1u32 << exponent)
            .min(Duration::from_millis(self.max_backoff_ms))
    }

    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        if self.host.trim().is_empty() {
            return Err(EngineError::Configuration(format!(
                "{}: host must not be empty",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: port must be between 1 and 65535",
                self.name
            )));
        }
        if self.ack_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: timeouts must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// 文件系统入站配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemInboundConfig {
    pub name: String,
    /// 投递目录
    pub directory: PathBuf,
    /// 文件扩展名，不区分大小写，可带或不带前导点
    pub extension: String,
    /// 轮询间隔
    pub poll_interval_ms: u64,
    /// 最后修改后需静置的时间，避免读取写入中的文件
    pub settle_time_ms: u64,
    /// 处理成功的文件移入此目录；未配置时删除
    pub processed_directory: Option<PathBuf>,
    /// 解析失败的文件移入此目录；未配置时原地保留
    pub error_directory: Option<PathBuf>,
    pub shutdown_timeout_ms: u64,
}

impl Default for FileSystemInboundConfig {
    fn default() -> Self {
        Self {
            name: "File System".to_string(),
            directory: PathBuf::from("."),
            extension: "hl7".to_string(),
            poll_interval_ms: 1_000,
            settle_time_ms: 500,
            processed_directory: None,
            error_directory: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl FileSystemInboundConfig {
    pub fn new(name: &str, directory: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            name: name.to_string(),
            directory: directory.into(),
            extension: extension.to_string(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// 规范化后的扩展名(小写，无前导点)
    pub fn normalized_extension(&self) -> String {
        self.extension.trim().trim_start_matches('.').to_lowercase()
    }

    pub fn validate(&self) -> Result<()> {
        require_name(&self.name)?;
        if self.normalized_extension().is_empty() {
            return Err(EngineError::Configuration(format!(
                "{}: extension must not be empty",
                self.name
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(EngineError::Configuration(format!(
                "{}: poll_interval_ms must be positive",
                self.name
            )));
        }
        for dir in [&self.processed_directory, &self.error_directory]
            .into_iter()
            .flatten()
        {
            if dir == &self.directory {
                return Err(EngineError::Configuration(format!(
                    "{}: {} cannot be the watched directory itself",
                    self.name,
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}
