//! 文件系统入站接口
//!
//! 定时轮询投递目录，每个文件包含一条HL7消息，按文件名顺序处理。

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use hl7_core::{EngineError, Result};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::base::{BaseInterface, InterfaceCore, Processed, Transport};
use crate::config::FileSystemInboundConfig;
use crate::events::{InterfaceError, InterfaceInfo, InterfaceKind, StatusKind};

pub type FileSystemInboundInterface = BaseInterface<FileSystemInboundTransport>;

/// 文件系统入站传输
pub struct FileSystemInboundTransport {
    config: FileSystemInboundConfig,
}

impl FileSystemInboundTransport {
    pub fn new(config: FileSystemInboundConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FileSystemInboundConfig {
        &self.config
    }
}

impl BaseInterface<FileSystemInboundTransport> {
    pub fn new(config: FileSystemInboundConfig) -> Self {
        Self::with_transport(FileSystemInboundTransport::new(config))
    }
}

async fn prepare_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await.map_err(|e| {
        EngineError::Configuration(format!("无法创建目录 {}: {}", path.display(), e))
    })
}

#[async_trait]
impl Transport for FileSystemInboundTransport {
    fn info(&self) -> InterfaceInfo {
        InterfaceInfo::new(&self.config.name, InterfaceKind::FileSystemInbound)
    }

    fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout()
    }

    async fn start_transport(
        &self,
        core: Arc<InterfaceCore>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        self.config.validate()?;

        let directory = &self.config.directory;
        let is_dir = fs::metadata(directory)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(EngineError::Configuration(format!(
                "投递目录不存在: {}",
                directory.display()
            )));
        }
        for target in [&self.config.processed_directory, &self.config.error_directory]
            .into_iter()
            .flatten()
        {
            prepare_directory(target).await?;
        }

        core.raise_status(
            StatusKind::Watching,
            format!(
                "Watching {} for *.{}",
                directory.display(),
                self.config.normalized_extension()
            ),
        );

        let watcher = Watcher {
            extension: self.config.normalized_extension(),
            core,
            config: self.config.clone(),
            consumed: HashSet::new(),
            rejected: HashMap::new(),
        };
        Ok(tokio::spawn(watcher.run(shutdown)))
    }
}

struct Watcher {
    core: Arc<InterfaceCore>,
    config: FileSystemInboundConfig,
    extension: String,
    /// 已处理但无法删除或移动的文件
    consumed: HashSet<PathBuf>,
    /// 解析失败且原地保留的文件及其修改时间
    rejected: HashMap<PathBuf, SystemTime>,
}

impl Watcher {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.poll(&shutdown).await {
                self.core.raise_error(
                    InterfaceError::new(e).with_origin(self.config.directory.display().to_string()),
                );
            }
        }
        debug!(interface = %self.core.name(), "目录轮询已停止");
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }

    /// 匹配扩展名的文件，按文件名排序
    async fn candidates(&self) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.config.directory).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.matches_extension(&path) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn poll(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let files = self.candidates().await?;

        let present: HashSet<&PathBuf> = files.iter().collect();
        self.consumed.retain(|path| present.contains(path));
        self.rejected.retain(|path, _| present.contains(path));

        for path in &files {
            if shutdown.is_cancelled() {
                break;
            }
            if self.consumed.contains(path) {
                continue;
            }

            let modified = match fs::metadata(path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(interface = %self.core.name(), path = %path.display(), error = %e, "无法读取文件属性");
                    continue;
                }
            };
            if self.rejected.get(path) == Some(&modified) {
                continue;
            }
            if !self.is_ready(path, modified).await {
                continue;
            }

            self.process_file(path, modified).await;
        }
        Ok(())
    }

    /// 文件已静置足够时间且未被其他进程独占
    async fn is_ready(&self, path: &Path, modified: SystemTime) -> bool {
        let settled = SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= self.config.settle_time())
            .unwrap_or(false);
        if !settled {
            return false;
        }

        match fs::OpenOptions::new().read(true).write(true).open(path).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                fs::OpenOptions::new().read(true).open(path).await.is_ok()
            }
            Err(_) => false,
        }
    }

    async fn process_file(&mut self, path: &Path, modified: SystemTime) {
        let origin = path.display().to_string();
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.rejected.insert(path.to_path_buf(), modified);
                self.core
                    .raise_error(InterfaceError::new(e.into()).with_origin(origin));
                return;
            }
        };

        let raw = self.core.decode_text(&bytes, &origin);
        match self.core.process_inbound(&raw, &origin) {
            Processed::Delivered { .. } => {
                let outcome = match &self.config.processed_directory {
                    Some(target) => move_into(path, target).await.map(Some),
                    None => fs::remove_file(path).await.map(|_| None),
                };
                match outcome {
                    Ok(Some(destination)) => {
                        debug!(interface = %self.core.name(), path = %origin, to = %destination.display(), "文件已归档");
                    }
                    Ok(None) => {
                        debug!(interface = %self.core.name(), path = %origin, "文件已删除");
                    }
                    Err(e) => {
                        warn!(interface = %self.core.name(), path = %origin, error = %e, "已处理的文件无法移除，将不再处理");
                        self.consumed.insert(path.to_path_buf());
                    }
                }
            }
            Processed::Failed { .. } => match &self.config.error_directory {
                Some(target) => {
                    if let Err(e) = move_into(path, target).await {
                        warn!(interface = %self.core.name(), path = %origin, error = %e, "无法移动错误文件");
                        self.rejected.insert(path.to_path_buf(), modified);
                    } else {
                        info!(interface = %self.core.name(), path = %origin, "错误文件已移至错误目录");
                    }
                }
                None => {
                    self.rejected.insert(path.to_path_buf(), modified);
                }
            },
        }
    }
}

/// 将文件移入目标目录，重名时追加时间戳；跨设备时退回复制后删除
async fn move_into(path: &Path, directory: &Path) -> std::io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?;

    let mut destination = directory.join(file_name);
    if fs::try_exists(&destination).await.unwrap_or(false) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = Utc::now().format("%Y%m%d%H%M%S%3f");
        let renamed = match path.extension() {
            Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
            None => format!("{}_{}", stem, suffix),
        };
        destination = directory.join(renamed);
    }

    if fs::rename(path, &destination).await.is_err() {
        fs::copy(path, &destination).await?;
        fs::remove_file(path).await?;
    }
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_into_avoids_collisions() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let first = source.path().join("msg.hl7");
        fs::write(&first, "MSH|^~\\&|A").await.unwrap();
        let moved = move_into(&first, target.path()).await.unwrap();
        assert_eq!(moved, target.path().join("msg.hl7"));

        fs::write(&first, "MSH|^~\\&|B").await.unwrap();
        let renamed = move_into(&first, target.path()).await.unwrap();
        assert_ne!(renamed, moved);
        assert_eq!(renamed.extension().unwrap(), "hl7");
        assert!(!fs::try_exists(&first).await.unwrap());
        assert_eq!(fs::read_to_string(&renamed).await.unwrap(), "MSH|^~\\&|B");
    }

    #[tokio::test]
    async fn test_missing_directory_fails_start() {
        let root = tempfile::tempdir().unwrap();
        let interface = FileSystemInboundInterface::new(FileSystemInboundConfig::new(
            "fs",
            root.path().join("missing"),
            "hl7",
        ));
        assert!(matches!(
            interface.start().await,
            Err(EngineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_extension_filter_and_order() {
        let root = tempfile::tempdir().unwrap();
        for name in ["b.HL7", "a.hl7", "c.txt", "d"] {
            fs::write(root.path().join(name), "x").await.unwrap();
        }
        fs::create_dir(root.path().join("dir.hl7")).await.unwrap();

        let watcher = Watcher {
            core: Arc::new(InterfaceCore::new(
                InterfaceInfo::new("fs", InterfaceKind::FileSystemInbound),
                false,
            )),
            config: FileSystemInboundConfig::new("fs", root.path(), ".hl7"),
            extension: "hl7".to_string(),
            consumed: HashSet::new(),
            rejected: HashMap::new(),
        };
        let names: Vec<_> = watcher
            .candidates()
            .await
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.hl7", "b.HL7"]);
    }
}
