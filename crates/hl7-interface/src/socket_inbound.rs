//! MLLP入站监听接口
//!
//! 每个连接在独立任务中处理，连接关闭或被重置视为会话正常结束。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hl7_core::{EngineError, Result};
use hl7_mllp::{MllpCodec, MllpFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::base::{BaseInterface, InterfaceCore, Transport};
use crate::config::SocketInboundConfig;
use crate::events::{InterfaceError, InterfaceInfo, InterfaceKind, StatusKind};

/// accept失败后的等待时间，避免文件描述符耗尽时空转
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

pub type SocketInboundInterface = BaseInterface<SocketInboundTransport>;

/// MLLP入站传输
pub struct SocketInboundTransport {
    config: SocketInboundConfig,
    local_addr: Mutex<Option<SocketAddr>>,
    active_connections: Arc<AtomicUsize>,
}

impl SocketInboundTransport {
    pub fn new(config: SocketInboundConfig) -> Self {
        Self {
            config,
            local_addr: Mutex::new(None),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SocketInboundConfig {
        &self.config
    }
}

impl BaseInterface<SocketInboundTransport> {
    pub fn new(config: SocketInboundConfig) -> Self {
        Self::with_transport(SocketInboundTransport::new(config))
    }

    /// 实际监听地址，端口配置为0时用于获取系统分配的端口
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .transport()
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前活动连接数
    pub fn active_connections(&self) -> usize {
        self.transport().active_connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SocketInboundTransport {
    fn info(&self) -> InterfaceInfo {
        InterfaceInfo::new(&self.config.name, InterfaceKind::SocketInbound)
    }

    fn send_acknowledgements(&self) -> bool {
        self.config.send_acknowledgements
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

        let address = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            EngineError::Configuration(format!("无法绑定监听地址 {}: {}", address, e))
        })?;
        let local_addr = listener.local_addr()?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        core.raise_status(StatusKind::Listening, format!("Listening on {}", local_addr));

        let acceptor = Acceptor {
            core,
            max_connections: self.config.max_connections,
            max_frame_length: self.config.max_frame_length,
            active_connections: self.active_connections.clone(),
        };
        Ok(tokio::spawn(acceptor.run(listener, shutdown)))
    }

    async fn stop_transport(&self) -> Result<()> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// 活动连接计数守卫
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Acceptor {
    core: Arc<InterfaceCore>,
    max_connections: usize,
    max_frame_length: usize,
    active_connections: Arc<AtomicUsize>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.active_connections.load(Ordering::SeqCst) >= self.max_connections {
                            warn!(
                                interface = %self.core.name(),
                                peer = %peer,
                                limit = self.max_connections,
                                "连接数已达上限，拒绝连接"
                            );
                            drop(stream);
                            continue;
                        }

                        info!(interface = %self.core.name(), peer = %peer, "接受连接");
                        let session = Session {
                            core: self.core.clone(),
                            peer,
                            _guard: ConnectionGuard::acquire(&self.active_connections),
                        };
                        sessions.spawn(session.run(
                            stream,
                            self.max_frame_length,
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!(interface = %self.core.name(), error = %e, "接受连接失败");
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_exit(&self.core, joined);
                }
            }
        }

        drop(listener);
        while let Some(joined) = sessions.join_next().await {
            log_session_exit(&self.core, joined);
        }
        debug!(interface = %self.core.name(), "监听已停止");
    }
}

fn log_session_exit(core: &InterfaceCore, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(interface = %core.name(), error = %e, "连接处理任务异常退出");
        }
    }
}

struct Session {
    core: Arc<InterfaceCore>,
    peer: SocketAddr,
    _guard: ConnectionGuard,
}

impl Session {
    async fn run(self, stream: TcpStream, max_frame_length: usize, shutdown: CancellationToken) {
        let origin = self.peer.to_string();
        let mut framed = Framed::new(stream, MllpCodec::with_max_frame_length(max_frame_length));

        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = framed.next() => frame,
            };

            match frame {
                Some(Ok(MllpFrame::Message(payload))) => {
                    let raw = self.core.decode_text(&payload, &origin);
                    let processed = self.core.process_inbound(&raw, &origin);
                    if let Some(ack) = processed.into_ack() {
                        if let Err(e) = framed.send(ack.to_string()).await {
                            self.report(e, &origin);
                            break;
                        }
                    }
                }
                Some(Ok(MllpFrame::Desync(fault))) => {
                    self.core
                        .raise_error(InterfaceError::new(fault.into()).with_origin(origin.as_str()));
                }
                Some(Err(e)) => {
                    self.report(e, &origin);
                    break;
                }
                None => break,
            }
        }

        debug!(interface = %self.core.name(), peer = %self.peer, "连接关闭");
    }

    fn report(&self, error: EngineError, origin: &str) {
        if error.is_connection_closed() {
            debug!(interface = %self.core.name(), peer = %self.peer, error = %error, "对端断开连接");
            return;
        }
        self.core.raise_error(
            InterfaceError::new(EngineError::Transport(error.to_string())).with_origin(origin),
        );
    }
}
