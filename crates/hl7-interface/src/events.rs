//! 接口事件
//!
//! 观察者按注册顺序在检测到事件的任务上同步调用。

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use hl7_core::EngineError;
use hl7_message::Message;
use serde::{Deserialize, Serialize};

/// 接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    SocketInbound,
    SocketOutbound,
    FileSystemInbound,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SocketInbound => "socket-inbound",
            Self::SocketOutbound => "socket-outbound",
            Self::FileSystemInbound => "filesystem-inbound",
        };
        f.write_str(name)
    }
}

/// 事件来源接口
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub kind: InterfaceKind,
}

impl InterfaceInfo {
    pub fn new(name: &str, kind: InterfaceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// 状态事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Starting,
    Started,
    Listening,
    Watching,
    Connected,
    Disconnected,
    Stopping,
    Stopped,
}

/// 状态事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceStatusEvent {
    pub kind: StatusKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl InterfaceStatusEvent {
    pub fn new(kind: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 错误事件
#[derive(Debug)]
pub struct InterfaceError {
    pub error: EngineError,
    /// 相关的原始消息文本(解析失败的输入或投递失败的消息)
    pub payload: Option<String>,
    /// 来源，例如对端地址或文件路径
    pub origin: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InterfaceError {
    pub fn new(error: EngineError) -> Self {
        Self {
            error,
            payload: None,
            origin: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

impl fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "{} ({})", self.error, origin),
            None => write!(f, "{}", self.error),
        }
    }
}

pub type MessageObserver = Arc<dyn Fn(&InterfaceInfo, &Arc<Message>) + Send + Sync>;
pub type StatusObserver = Arc<dyn Fn(&InterfaceInfo, &InterfaceStatusEvent) + Send + Sync>;
pub type ErrorObserver = Arc<dyn Fn(&InterfaceInfo, &InterfaceError) + Send + Sync>;

/// 观察者注册表
#[derive(Default)]
pub struct EventHub {
    message: RwLock<Vec<MessageObserver>>,
    status: RwLock<Vec<StatusObserver>>,
    error: RwLock<Vec<ErrorObserver>>,
}

/// 复制一份观察者列表，调用期间不持有锁
fn snapshot<T: Clone>(observers: &RwLock<Vec<T>>) -> Vec<T> {
    observers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &Arc<Message>) + Send + Sync + 'static,
    {
        self.message
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    pub fn on_status<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &InterfaceStatusEvent) + Send + Sync + 'static,
    {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &InterfaceError) + Send + Sync + 'static,
    {
        self.error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    pub fn raise_message(&self, info: &InterfaceInfo, message: &Arc<Message>) {
        for observer in snapshot(&self.message) {
            observer(info, message);
        }
    }

    pub fn raise_status(&self, info: &InterfaceInfo, event: &InterfaceStatusEvent) {
        for observer in snapshot(&self.status) {
            observer(info, event);
        }
    }

    pub fn raise_error(&self, info: &InterfaceInfo, error: &InterfaceError) {
        for observer in snapshot(&self.error) {
            observer(info, error);
        }
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("message", &snapshot(&self.message).len())
            .field("status", &snapshot(&self.status).len())
            .field("error", &snapshot(&self.error).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_observers_called_in_registration_order() {
        let hub = EventHub::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let calls = calls.clone();
            hub.on_status(move |_, event| {
                calls.lock().unwrap().push((id, event.kind));
            });
        }

        let info = InterfaceInfo::new("in", InterfaceKind::SocketInbound);
        hub.raise_status(&info, &InterfaceStatusEvent::new(StatusKind::Started, "up"));

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                (0, StatusKind::Started),
                (1, StatusKind::Started),
                (2, StatusKind::Started)
            ]
        );
    }

    #[test]
    fn test_observer_may_register_during_dispatch() {
        let hub = Arc::new(EventHub::new());
        let inner = hub.clone();
        hub.on_error(move |_, _| inner.on_error(|_, _| {}));

        let info = InterfaceInfo::new("fs", InterfaceKind::FileSystemInbound);
        hub.raise_error(
            &info,
            &InterfaceError::new(EngineError::Parse("bad".to_string())),
        );
        assert_eq!(snapshot(&hub.error).len(), 2);
    }

    #[test]
    fn test_error_event_details() {
        let error = InterfaceError::new(EngineError::Transport("reset".to_string()))
            .with_origin("127.0.0.1:9000")
            .with_payload("MSH|...");
        assert_eq!(error.payload.as_deref(), Some("MSH|..."));
        assert!(error.to_string().contains("127.0.0.1:9000"));
    }
}
