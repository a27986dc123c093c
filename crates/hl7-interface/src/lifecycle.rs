//! 接口生命周期状态机
//!
//! Stopped → Starting → Running → Stopping → Stopped，启动失败时 Starting → Stopped。

use hl7_core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 接口运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InterfaceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 生命周期事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Start,
    Started,
    StartFailed,
    Stop,
    Stopped,
}

/// 接口状态机
#[derive(Debug)]
pub struct InterfaceStateMachine {
    current: InterfaceState,
    transitions: HashMap<(InterfaceState, LifecycleEvent), InterfaceState>,
}

impl InterfaceStateMachine {
    /// 创建处于 Stopped 状态的状态机
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((InterfaceState::Stopped, LifecycleEvent::Start), InterfaceState::Starting);
        transitions.insert((InterfaceState::Starting, LifecycleEvent::Started), InterfaceState::Running);
        transitions.insert((InterfaceState::Starting, LifecycleEvent::StartFailed), InterfaceState::Stopped);
        transitions.insert((InterfaceState::Running, LifecycleEvent::Stop), InterfaceState::Stopping);
        transitions.insert((InterfaceState::Stopping, LifecycleEvent::Stopped), InterfaceState::Stopped);

        Self {
            current: InterfaceState::Stopped,
            transitions,
        }
    }

    pub fn state(&self) -> InterfaceState {
        self.current
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, event: LifecycleEvent) -> bool {
        self.transitions.contains_key(&(self.current, event))
    }

    /// 执行状态转换
    pub fn transition(&mut self, event: LifecycleEvent) -> Result<InterfaceState> {
        match self.transitions.get(&(self.current, event)) {
            Some(to) => {
                self.current = *to;
                Ok(*to)
            }
            None => Err(EngineError::InvalidStateTransition {
                from: format!("{:?}", self.current),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 当前状态下可触发的事件
    pub fn possible_events(&self) -> Vec<LifecycleEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == self.current)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for InterfaceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
