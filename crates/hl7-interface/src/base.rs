//! 接口基础设施
//!
//! `InterfaceCore` 负责统计、事件与应答；`BaseInterface<T>` 负责生命周期，
//! 具体的收发循环由 `Transport` 实现并运行在独立的任务上。

use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hl7_core::utils::preview;
use hl7_core::{EngineError, Result};
use hl7_message::{Hl7Parser, Message};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ack::{AckPolicy, AlwaysAccept};
use crate::events::{
    EventHub, InterfaceError, InterfaceInfo, InterfaceKind, InterfaceStatusEvent, StatusKind,
};
use crate::lifecycle::{InterfaceState, InterfaceStateMachine, LifecycleEvent};
use crate::statistics::{InterfaceStatistics, StatisticsSnapshot};

/// 入站消息处理结果
#[derive(Debug)]
pub enum Processed {
    /// 解析成功并已投递给观察者
    Delivered {
        message: Arc<Message>,
        ack: Option<Message>,
    },
    /// 解析失败，已触发错误事件
    Failed { ack: Option<Message> },
}

impl Processed {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// 需要回复给对端的应答
    pub fn into_ack(self) -> Option<Message> {
        match self {
            Self::Delivered { ack, .. } | Self::Failed { ack } => ack,
        }
    }
}

/// 接口共享状态，传输任务通过 `Arc` 持有
pub struct InterfaceCore {
    info: InterfaceInfo,
    send_acknowledgements: bool,
    statistics: InterfaceStatistics,
    events: EventHub,
    ack_policy: RwLock<Arc<dyn AckPolicy>>,
    parser: Hl7Parser,
}

impl InterfaceCore {
    pub fn new(info: InterfaceInfo, send_acknowledgements: bool) -> Self {
        Self {
            info,
            send_acknowledgements,
            statistics: InterfaceStatistics::new(),
            events: EventHub::new(),
            ack_policy: RwLock::new(Arc::new(AlwaysAccept)),
            parser: Hl7Parser::new(),
        }
    }

    pub fn info(&self) -> &InterfaceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn statistics(&self) -> &InterfaceStatistics {
        &self.statistics
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    fn ack_policy(&self) -> Arc<dyn AckPolicy> {
        self.ack_policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_ack_policy(&self, policy: Arc<dyn AckPolicy>) {
        *self
            .ack_policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// 解析并投递一条入站消息：统计 → 消息事件 → 应答
    pub fn process_inbound(&self, raw: &str, origin: &str) -> Processed {
        match self.parser.parse(raw) {
            Ok(message) => {
                let message = Arc::new(message);
                debug!(
                    interface = %self.info.name,
                    origin = %origin,
                    message_type = %message.message_type(),
                    control_id = %message.control_id(),
                    "Received HL7 message"
                );
                self.deliver(&message);

                let ack = if self.send_acknowledgements {
                    self.ack_policy().acknowledge(&message)
                } else {
                    None
                };
                Processed::Delivered { message, ack }
            }
            Err(parse_error) => {
                let ack = if self.send_acknowledgements {
                    self.ack_policy().reject(raw, &parse_error)
                } else {
                    None
                };
                self.raise_error(
                    InterfaceError::new(parse_error.into())
                        .with_payload(raw)
                        .with_origin(origin),
                );
                Processed::Failed { ack }
            }
        }
    }

    /// 将收到的字节按UTF-8解码，无效字节替换为U+FFFD并记录警告
    pub fn decode_text<'a>(&self, bytes: &'a [u8], origin: &str) -> Cow<'a, str> {
        let text = String::from_utf8_lossy(bytes);
        if let Cow::Owned(_) = text {
            warn!(
                interface = %self.info.name,
                origin = %origin,
                bytes = bytes.len(),
                "Payload is not valid UTF-8, invalid bytes replaced"
            );
        }
        text
    }

    /// 按消息自身的类型统计并触发消息事件
    pub fn deliver(&self, message: &Arc<Message>) {
        self.deliver_as(message, message.message_type());
    }

    /// 按指定的消息类型统计并触发消息事件
    pub fn deliver_as(&self, message: &Arc<Message>, message_type: &str) {
        self.statistics.record_success(message_type);
        self.events.raise_message(&self.info, message);
    }

    pub fn raise_status(&self, kind: StatusKind, text: impl Into<String>) {
        let event = InterfaceStatusEvent::new(kind, text);
        info!(interface = %self.info.name, status = ?event.kind, "{}", event.text);
        self.events.raise_status(&self.info, &event);
    }

    pub fn raise_error(&self, error: InterfaceError) {
        self.statistics.record_error();
        warn!(
            interface = %self.info.name,
            origin = error.origin.as_deref().unwrap_or(""),
            error = %error.error,
            payload = %error.payload.as_deref().map(|p| preview(p, 80)).unwrap_or_default(),
            "Interface error"
        );
        self.events.raise_error(&self.info, &error);
    }
}

/// 具体传输实现
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn info(&self) -> InterfaceInfo;

    /// 入站接口是否回复应答
    fn send_acknowledgements(&self) -> bool {
        false
    }

    /// 停止时等待运行任务结束的时间
    fn shutdown_timeout(&self) -> Duration;

    /// 完成启动准备(绑定、校验目录等)并派生运行任务。
    /// 运行任务必须在 `shutdown` 被取消后尽快退出。
    async fn start_transport(
        &self,
        core: Arc<InterfaceCore>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>>;

    /// 运行任务结束后调用，释放传输持有的资源
    async fn stop_transport(&self) -> Result<()> {
        Ok(())
    }
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// 通用接口，按传输类型组合
pub struct BaseInterface<T: Transport> {
    core: Arc<InterfaceCore>,
    transport: T,
    lifecycle: Mutex<InterfaceStateMachine>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl<T: Transport> BaseInterface<T> {
    pub fn with_transport(transport: T) -> Self {
        let core = InterfaceCore::new(transport.info(), transport.send_acknowledgements());
        Self {
            core: Arc::new(core),
            transport,
            lifecycle: Mutex::new(InterfaceStateMachine::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn info(&self) -> &InterfaceInfo {
        self.core.info()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn core(&self) -> &Arc<InterfaceCore> {
        &self.core
    }

    pub fn state(&self) -> InterfaceState {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.core.statistics().snapshot()
    }

    pub fn events(&self) -> &EventHub {
        self.core.events()
    }

    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &Arc<Message>) + Send + Sync + 'static,
    {
        self.core.events().on_message(observer);
    }

    pub fn on_status<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &InterfaceStatusEvent) + Send + Sync + 'static,
    {
        self.core.events().on_status(observer);
    }

    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &InterfaceError) + Send + Sync + 'static,
    {
        self.core.events().on_error(observer);
    }

    pub fn set_ack_policy(&self, policy: Arc<dyn AckPolicy>) {
        self.core.set_ack_policy(policy);
    }

    fn transition(&self, event: LifecycleEvent) -> Result<InterfaceState> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .transition(event)
    }

    /// 启动接口，准备完成后返回；已在运行时直接返回
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(interface = %self.name(), "Interface already running");
            return Ok(());
        }

        self.transition(LifecycleEvent::Start)?;
        self.core
            .raise_status(StatusKind::Starting, format!("Starting {}", self.info().kind));

        let shutdown = CancellationToken::new();
        match self
            .transport
            .start_transport(self.core.clone(), shutdown.clone())
            .await
        {
            Ok(task) => {
                self.transition(LifecycleEvent::Started)?;
                self.core.statistics().mark_started();
                *running = Some(Running { shutdown, task });
                self.core
                    .raise_status(StatusKind::Started, format!("{} started", self.name()));
                Ok(())
            }
            Err(start_error) => {
                shutdown.cancel();
                self.transition(LifecycleEvent::StartFailed)?;

                let text = match start_error {
                    EngineError::Configuration(text) => text,
                    other => other.to_string(),
                };
                error!(interface = %self.name(), error = %text, "Failed to start interface");
                self.core
                    .raise_error(InterfaceError::new(EngineError::Configuration(text.clone())));
                Err(EngineError::Configuration(text))
            }
        }
    }

    /// 停止接口；未运行时直接返回
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(Running { shutdown, mut task }) = running.take() else {
            return Ok(());
        };

        self.transition(LifecycleEvent::Stop)?;
        self.core
            .raise_status(StatusKind::Stopping, format!("Stopping {}", self.name()));
        shutdown.cancel();

        let timeout = self.transport.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_error)) => {
                error!(interface = %self.name(), error = %join_error, "Interface task failed");
            }
            Err(_) => {
                warn!(
                    interface = %self.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Interface task did not stop in time, aborting"
                );
                task.abort();
                let _ = task.await;
            }
        }

        if let Err(e) = self.transport.stop_transport().await {
            warn!(interface = %self.name(), error = %e, "Failed to release transport resources");
        }
        self.transition(LifecycleEvent::Stopped)?;
        self.core
            .raise_status(StatusKind::Stopped, format!("{} stopped", self.name()));
        Ok(())
    }
}

impl<T: Transport> Drop for BaseInterface<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

/// 引擎统一管理的接口
#[async_trait]
pub trait ManagedInterface: Send + Sync {
    fn info(&self) -> &InterfaceInfo;

    fn kind(&self) -> InterfaceKind {
        self.info().kind
    }

    fn state(&self) -> InterfaceState;

    fn statistics(&self) -> StatisticsSnapshot;

    fn events(&self) -> &EventHub;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

#[async_trait]
impl<T: Transport> ManagedInterface for BaseInterface<T> {
    fn info(&self) -> &InterfaceInfo {
        BaseInterface::info(self)
    }

    fn state(&self) -> InterfaceState {
        BaseInterface::state(self)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        BaseInterface::statistics(self)
    }

    fn events(&self) -> &EventHub {
        BaseInterface::events(self)
    }

    async fn start(&self) -> Result<()> {
        BaseInterface::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        BaseInterface::stop(self).await
    }
}
