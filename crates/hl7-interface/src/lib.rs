//! # HL7接口模块
//!
//! 接口生命周期、事件、统计以及具体传输：
//! - MLLP over TCP 入站监听
//! - MLLP over TCP 出站发送队列
//! - 文件系统投递目录轮询

pub mod ack;
pub mod base;
pub mod config;
pub mod events;
pub mod filesystem;
pub mod lifecycle;
pub mod socket_inbound;
pub mod socket_outbound;
pub mod statistics;

pub use ack::{AckPolicy, AlwaysAccept};
pub use base::{BaseInterface, InterfaceCore, ManagedInterface, Processed, Transport};
pub use config::{FileSystemInboundConfig, SocketInboundConfig, SocketOutboundConfig};
pub use events::{
    EventHub, InterfaceError, InterfaceInfo, InterfaceKind, InterfaceStatusEvent, StatusKind,
};
pub use filesystem::{FileSystemInboundInterface, FileSystemInboundTransport};
pub use lifecycle::{InterfaceState, InterfaceStateMachine, LifecycleEvent};
pub use socket_inbound::{SocketInboundInterface, SocketInboundTransport};
pub use socket_outbound::{OutboundQueue, SocketOutboundInterface, SocketOutboundTransport};
pub use statistics::{InterfaceStatistics, StatisticsSnapshot};
