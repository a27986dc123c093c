//! 接口注册与管理

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hl7_core::{EngineError, Result};
use hl7_interface::{
    FileSystemInboundConfig, FileSystemInboundInterface, InterfaceError, InterfaceInfo,
    InterfaceStatusEvent, ManagedInterface, SocketInboundConfig, SocketInboundInterface,
    SocketOutboundConfig, SocketOutboundInterface, StatisticsSnapshot,
};
use hl7_message::Message;
use tracing::{error, info};

use crate::config::{EngineConfig, InterfaceDefinition};

/// HL7集成引擎
#[derive(Default)]
pub struct Engine {
    interfaces: Vec<Arc<dyn ManagedInterface>>,
    socket_inbound: HashMap<String, Arc<SocketInboundInterface>>,
    socket_outbound: HashMap<String, Arc<SocketOutboundInterface>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置创建全部接口(不启动)
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut engine = Self::new();
        for definition in &config.interfaces {
            match definition {
                InterfaceDefinition::SocketInbound(c) => {
                    engine.add_socket_inbound(c.clone())?;
                }
                InterfaceDefinition::SocketOutbound(c) => {
                    engine.add_socket_outbound(c.clone())?;
                }
                InterfaceDefinition::FileSystemInbound(c) => {
                    engine.add_file_system_inbound(c.clone())?;
                }
            }
        }
        Ok(engine)
    }

    fn register(&mut self, interface: Arc<dyn ManagedInterface>) -> Result<()> {
        let name = interface.info().name.clone();
        if self.interface(&name).is_some() {
            return Err(EngineError::Configuration(format!(
                "duplicate interface name: {}",
                name
            )));
        }
        info!(interface = %name, kind = %interface.kind(), "Registered interface");
        self.interfaces.push(interface);
        Ok(())
    }

    pub fn add_socket_inbound(
        &mut self,
        config: SocketInboundConfig,
    ) -> Result<Arc<SocketInboundInterface>> {
        config.validate()?;
        let interface = Arc::new(SocketInboundInterface::new(config));
        self.register(interface.clone())?;
        self.socket_inbound
            .insert(interface.name().to_string(), interface.clone());
        Ok(interface)
    }

    pub fn add_socket_outbound(
        &mut self,
        config: SocketOutboundConfig,
    ) -> Result<Arc<SocketOutboundInterface>> {
        config.validate()?;
        let interface = Arc::new(SocketOutboundInterface::new(config));
        self.register(interface.clone())?;
        self.socket_outbound
            .insert(interface.name().to_string(), interface.clone());
        Ok(interface)
    }

    pub fn add_file_system_inbound(
        &mut self,
        config: FileSystemInboundConfig,
    ) -> Result<Arc<FileSystemInboundInterface>> {
        config.validate()?;
        let interface = Arc::new(FileSystemInboundInterface::new(config));
        self.register(interface.clone())?;
        Ok(interface)
    }

    pub fn interfaces(&self) -> &[Arc<dyn ManagedInterface>] {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&Arc<dyn ManagedInterface>> {
        self.interfaces.iter().find(|i| i.info().name == name)
    }

    pub fn socket_inbound(&self, name: &str) -> Option<&Arc<SocketInboundInterface>> {
        self.socket_inbound.get(name)
    }

    /// 出站接口，用于投递消息
    pub fn outbound(&self, name: &str) -> Option<&Arc<SocketOutboundInterface>> {
        self.socket_outbound.get(name)
    }

    /// 订阅所有已注册接口的消息事件
    pub fn subscribe_messages<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &Arc<Message>) + Send + Sync + 'static,
    {
        let observer = Arc::new(observer);
        for interface in &self.interfaces {
            let observer = observer.clone();
            interface
                .events()
                .on_message(move |info, message| observer(info, message));
        }
    }

    pub fn subscribe_status<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &InterfaceStatusEvent) + Send + Sync + 'static,
    {
        let observer = Arc::new(observer);
        for interface in &self.interfaces {
            let observer = observer.clone();
            interface
                .events()
                .on_status(move |info, event| observer(info, event));
        }
    }

    pub fn subscribe_errors<F>(&self, observer: F)
    where
        F: Fn(&InterfaceInfo, &InterfaceError) + Send + Sync + 'static,
    {
        let observer = Arc::new(observer);
        for interface in &self.interfaces {
            let observer = observer.clone();
            interface
                .events()
                .on_error(move |info, error| observer(info, error));
        }
    }

    /// 按注册顺序启动；任一接口启动失败时停止已启动的接口
    pub async fn start_all(&self) -> Result<()> {
        for (index, interface) in self.interfaces.iter().enumerate() {
            if let Err(e) = interface.start().await {
                error!(interface = %interface.info().name, error = %e, "Engine start aborted");
                for started in self.interfaces[..index].iter().rev() {
                    if let Err(stop_error) = started.stop().await {
                        error!(interface = %started.info().name, error = %stop_error, "Failed to stop interface");
                    }
                }
                return Err(e);
            }
        }
        info!(interfaces = self.interfaces.len(), "Engine started");
        Ok(())
    }

    /// 按注册的逆序停止全部接口，返回遇到的第一个错误
    pub async fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for interface in self.interfaces.iter().rev() {
            if let Err(e) = interface.stop().await {
                error!(interface = %interface.info().name, error = %e, "Failed to stop interface");
                first_error.get_or_insert(e);
            }
        }
        info!("Engine stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// 各接口统计快照
    pub fn statistics(&self) -> BTreeMap<String, StatisticsSnapshot> {
        self.interfaces
            .iter()
            .map(|i| (i.info().name.clone(), i.statistics()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use hl7_interface::{InterfaceState, StatusKind};
    use hl7_message::{build_ack, AckCode};
    use hl7_mllp::{MllpCodec, MllpFrame};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::codec::Framed;

    const ORM: &str =
        "MSH|^~\\&|HIS|WARD|LIS|LAB|20230101120000||ORM^O01|ORD1|P|2.4\rORC|NW|1001\r";

    #[test]
    fn test_from_config_builds_interfaces() {
        let config = EngineConfig::from_toml_str(
            r#"
[[interfaces]]
type = "socket_inbound"
name = "in"
port = 0

[[interfaces]]
type = "socket_outbound"
name = "out"
port = 7000
"#,
        )
        .unwrap();
        let engine = Engine::from_config(&config).unwrap();

        assert_eq!(engine.interfaces().len(), 2);
        assert!(engine.socket_inbound("in").is_some());
        assert!(engine.outbound("out").is_some());
        assert!(engine.outbound("in").is_none());
        assert_eq!(
            engine.statistics().keys().cloned().collect::<Vec<_>>(),
            vec!["in", "out"]
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut engine = Engine::new();
        engine
            .add_socket_inbound(SocketInboundConfig::new("dup", 0))
            .unwrap();
        let result = engine.add_socket_outbound(SocketOutboundConfig::new("dup", "127.0.0.1", 7000));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
        assert_eq!(engine.interfaces().len(), 1);
    }

    #[tokio::test]
    async fn test_routes_file_drop_to_outbound_peer() {
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        let (tx, mut received) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = peer.accept().await.unwrap();
            let mut framed = Framed::new(stream, MllpCodec::new());
            while let Some(Ok(MllpFrame::Message(bytes))) = framed.next().await {
                let message = Message::parse(&String::from_utf8_lossy(&bytes)).unwrap();
                tx.send(message.control_id().to_string()).unwrap();
                let ack = build_ack(&message, AckCode::Accept, None);
                if framed.send(ack.to_string()).await.is_err() {
                    break;
                }
            }
        });

        let drop_dir = tempfile::tempdir().unwrap();
        std::fs::write(drop_dir.path().join("order.hl7"), ORM).unwrap();

        let mut engine = Engine::new();
        engine
            .add_file_system_inbound(FileSystemInboundConfig {
                poll_interval_ms: 20,
                settle_time_ms: 0,
                ..FileSystemInboundConfig::new("orders", drop_dir.path(), "hl7")
            })
            .unwrap();
        let outbound = engine
            .add_socket_outbound(SocketOutboundConfig::new("lab", "127.0.0.1", peer_port))
            .unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        engine.subscribe_status(move |info, event| {
            sink.lock().unwrap().push((info.name.clone(), event.kind));
        });
        engine.subscribe_messages(move |info, message| {
            if info.name == "orders" {
                outbound.enqueue_message(message.to_string());
            }
        });

        engine.start_all().await.unwrap();
        let control_id = tokio::time::timeout(Duration::from_secs(10), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control_id, "ORD1");

        let lab = engine.outbound("lab").unwrap().clone();
        tokio::time::timeout(Duration::from_secs(10), async {
            while lab.pending_messages() > 0 || lab.statistics().total_successes() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        engine.stop_all().await.unwrap();

        let stats = engine.statistics();
        assert_eq!(stats["orders"].successes["ORM^O01"], 1);
        assert_eq!(stats["lab"].successes["ORM^O01"], 1);
        assert!(engine
            .interfaces()
            .iter()
            .all(|i| i.state() == InterfaceState::Stopped));

        let statuses = statuses.lock().unwrap();
        assert!(statuses.contains(&("orders".to_string(), StatusKind::Watching)));
        assert!(statuses.contains(&("lab".to_string(), StatusKind::Connected)));
        assert!(statuses.contains(&("lab".to_string(), StatusKind::Stopped)));
    }

    #[tokio::test]
    async fn test_start_all_rolls_back_on_failure() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut engine = Engine::new();
        engine
            .add_socket_inbound(SocketInboundConfig {
                bind_address: "127.0.0.1".to_string(),
                ..SocketInboundConfig::new("first", 0)
            })
            .unwrap();
        engine
            .add_socket_inbound(SocketInboundConfig {
                bind_address: "127.0.0.1".to_string(),
                ..SocketInboundConfig::new("second", port)
            })
            .unwrap();

        let result = engine.start_all().await;
        assert!(matches!(result, Err(EngineError::Configuration(_))));
        assert!(engine
            .interfaces()
            .iter()
            .all(|i| i.state() == InterfaceState::Stopped));
        engine.stop_all().await.unwrap();
    }
}
