//! MLLP出站发送接口
//!
//! 单一发送任务按先进先出顺序逐条发送，收到应答后才出队，
//! 同一时刻只有一条消息在途。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hl7_core::{EngineError, Result};
use hl7_message::{AckCode, Message};
use hl7_mllp::{MllpCodec, MllpFrame};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::base::{BaseInterface, InterfaceCore, Transport};
use crate::config::SocketOutboundConfig;
use crate::events::{InterfaceError, InterfaceInfo, InterfaceKind, StatusKind};

pub type SocketOutboundInterface = BaseInterface<SocketOutboundTransport>;

/// 出站消息队列
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: String) {
        self.lock().push_back(message);
        self.notify.notify_one();
    }

    pub fn front(&self) -> Option<String> {
        self.lock().front().cloned()
    }

    pub fn pop_front(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 等待队首消息，不出队
    pub async fn wait_front(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(front) = self.front() {
                return front;
            }
            notified.await;
        }
    }
}

/// MLLP出站传输
pub struct SocketOutboundTransport {
    config: SocketOutboundConfig,
    queue: Arc<OutboundQueue>,
    connected: Arc<AtomicBool>,
}

impl SocketOutboundTransport {
    pub fn new(config: SocketOutboundConfig) -> Self {
        Self {
            config,
            queue: Arc::new(OutboundQueue::new()),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SocketOutboundConfig {
        &self.config
    }
}

impl BaseInterface<SocketOutboundTransport> {
    pub fn new(config: SocketOutboundConfig) -> Self {
        Self::with_transport(SocketOutboundTransport::new(config))
    }

    /// 加入发送队列，立即返回；接口未启动时消息保留到启动后发送
    pub fn enqueue_message(&self, message: impl Into<String>) {
        self.transport().queue.push(message.into());
    }

    /// 尚未确认的消息数(含在途消息)
    pub fn pending_messages(&self) -> usize {
        self.transport().queue.len()
    }

    pub fn is_connected(&self) -> bool {
        self.transport().connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SocketOutboundTransport {
    fn info(&self) -> InterfaceInfo {
        InterfaceInfo::new(&self.config.name, InterfaceKind::SocketOutbound)
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

        let sender = Sender {
            core,
            config: self.config.clone(),
            queue: self.queue.clone(),
            connected: self.connected.clone(),
            connection: None,
        };
        Ok(tokio::spawn(sender.run(shutdown)))
    }
}

struct Sender {
    core: Arc<InterfaceCore>,
    config: SocketOutboundConfig,
    queue: Arc<OutboundQueue>,
    connected: Arc<AtomicBool>,
    connection: Option<Framed<TcpStream, MllpCodec>>,
}

impl Sender {
    async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interface = %self.core.name(),
            peer = %self.config.address(),
            pending = self.queue.len(),
            "Outbound sender started"
        );

        loop {
            let payload = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                payload = self.queue.wait_front() => payload,
            };

            if !self.deliver(&payload, &shutdown).await {
                break;
            }
            self.queue.pop_front();
        }

        self.disconnect("Interface stopped");
        debug!(
            interface = %self.core.name(),
            pending = self.queue.len(),
            "Outbound sender stopped"
        );
    }

    /// 发送一条消息直到确认或重试耗尽；在途的发送不受取消影响，
    /// 重试等待期间被取消时返回 false，消息留在队列中
    async fn deliver(&mut self, payload: &str, shutdown: &CancellationToken) -> bool {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let failure = match self.transmit(payload).await {
                Ok(ack) => {
                    self.handle_ack(payload, ack);
                    return true;
                }
                Err(failure) => failure,
            };

            self.disconnect(&failure.to_string());
            if attempts > self.config.max_retries {
                warn!(
                    interface = %self.core.name(),
                    attempts,
                    error = %failure,
                    "Giving up on outbound message"
                );
                self.core.raise_error(
                    InterfaceError::new(EngineError::DeliveryFailed {
                        attempts,
                        reason: failure.to_string(),
                    })
                    .with_payload(payload)
                    .with_origin(self.config.address()),
                );
                return true;
            }

            let delay = self.config.backoff(attempts);
            debug!(
                interface = %self.core.name(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Outbound send failed, retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut Framed<TcpStream, MllpCodec>> {
        if self.connection.is_none() {
            let address = self.config.address();
            let stream = tokio::time::timeout(
                self.config.connect_timeout(),
                TcpStream::connect(&address),
            )
            .await
            .map_err(|_| EngineError::Timeout {
                operation: format!("connect to {}", address),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
            stream.set_nodelay(true)?;

            self.connection = Some(Framed::new(
                stream,
                MllpCodec::with_max_frame_length(self.config.max_frame_length),
            ));
            self.connected.store(true, Ordering::SeqCst);
            self.core
                .raise_status(StatusKind::Connected, format!("Connected to {}", address));
        }

        self.connection
            .as_mut()
            .ok_or_else(|| EngineError::Internal("outbound connection unavailable".to_string()))
    }

    /// 发送并等待应答
    async fn transmit(&mut self, payload: &str) -> Result<Message> {
        let ack_timeout = self.config.ack_timeout();
        let timeout_ms = self.config.ack_timeout_ms;
        let core = self.core.clone();
        let peer = self.config.address();

        let framed = self.connection().await?;
        framed.send(payload).await?;

        let deadline = tokio::time::Instant::now() + ack_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, framed.next())
                .await
                .map_err(|_| EngineError::Timeout {
                    operation: "waiting for acknowledgement".to_string(),
                    timeout_ms,
                })?;

            match frame {
                Some(Ok(MllpFrame::Message(bytes))) => {
                    let text = core.decode_text(&bytes, &peer);
                    return Message::parse(&text).map_err(EngineError::from);
                }
                Some(Ok(MllpFrame::Desync(fault))) => {
                    warn!(interface = %core.name(), error = %fault, "Discarded malformed response frame");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(EngineError::Transport(
                        "connection closed before acknowledgement".to_string(),
                    ))
                }
            }
        }
    }

    fn handle_ack(&self, payload: &str, ack: Message) {
        let sent = Message::parse(payload).ok();
        let sent_type = sent
            .as_ref()
            .map(|m| m.message_type().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let sent_control_id = sent.as_ref().map(|m| m.control_id()).unwrap_or("");

        if !sent_control_id.is_empty() && ack.acknowledged_control_id() != sent_control_id {
            warn!(
                interface = %self.core.name(),
                expected = %sent_control_id,
                received = %ack.acknowledged_control_id(),
                "Acknowledgement control ID mismatch"
            );
        }

        match ack.ack_code() {
            Some(code @ (AckCode::Error | AckCode::Reject)) => {
                self.core.raise_error(
                    InterfaceError::new(EngineError::Rejected {
                        control_id: sent_control_id.to_string(),
                        code: code.to_string(),
                        text: ack.ack_text().to_string(),
                    })
                    .with_payload(payload)
                    .with_origin(self.config.address()),
                );
            }
            code => {
                if code.is_none() {
                    warn!(interface = %self.core.name(), "Response has no MSA segment, treating as accepted");
                }
                debug!(
                    interface = %self.core.name(),
                    control_id = %sent_control_id,
                    "Outbound message acknowledged"
                );
                self.core.deliver_as(&Arc::new(ack), &sent_type);
            }
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if self.connection.take().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            self.core.raise_status(StatusKind::Disconnected, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_fifo_and_wait() {
        let queue = Arc::new(OutboundQueue::new());
        assert!(queue.is_empty());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_front().await })
        };
        tokio::task::yield_now().await;
        queue.push("first".to_string());
        queue.push("second".to_string());

        assert_eq!(waiter.await.unwrap(), "first");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().as_deref(), Some("first"));
        assert_eq!(queue.wait_front().await, "second");
    }

    #[tokio::test]
    async fn test_enqueue_before_start_is_kept() {
        let interface =
            SocketOutboundInterface::new(SocketOutboundConfig::new("out", "127.0.0.1", 9));
        interface.enqueue_message("MSH|^~\\&|A");
        interface.enqueue_message("MSH|^~\\&|B");
        assert_eq!(interface.pending_messages(), 2);
        assert!(!interface.is_connected());
    }
}
