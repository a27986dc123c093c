//! 接口统计

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    started_at: Option<DateTime<Utc>>,
    last_message_at: Option<DateTime<Utc>>,
    successes: BTreeMap<String, u64>,
    errors: u64,
}

/// 接口统计，多个连接任务共享
#[derive(Debug, Default)]
pub struct InterfaceStatistics {
    inner: Mutex<Counters>,
}

/// 统计快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// 按消息类型(MSH-9)统计的成功数
    pub successes: BTreeMap<String, u64>,
    pub errors: u64,
}

impl StatisticsSnapshot {
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|started| Utc::now() - started)
    }

    pub fn total_successes(&self) -> u64 {
        self.successes.values().sum()
    }
}

impl InterfaceStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 记录启动时间，重新启动时刷新
    pub fn mark_started(&self) {
        self.lock().started_at = Some(Utc::now());
    }

    pub fn record_success(&self, message_type: &str) {
        let mut counters = self.lock();
        counters.last_message_at = Some(Utc::now());
        *counters
            .successes
            .entry(message_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let counters = self.lock();
        StatisticsSnapshot {
            started_at: counters.started_at,
            last_message_at: counters.last_message_at,
            successes: counters.successes.clone(),
            errors: counters.errors,
        }
    }
}
