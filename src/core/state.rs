//! 状态定义：AgentStatus、AgentState、增量补丁与快照
//!
//! AgentState 只通过 AgentStatePatch 合并修改（字段级），从不整体替换；
//! Snapshot 是 Dispatcher 每轮读取一次的不可变副本。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent 状态（对外可见）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Unknown,
    Idle,
    Pending,
    Working,
    Dead,
}

impl AgentStatus {
    /// 状态机允许的迁移；自环总是允许，Dead 不可离开
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Unknown, Idle) | (Unknown, Pending) => true,
            (Idle, Pending) | (Idle, Working) => true,
            (Pending, Idle) | (Pending, Working) => true,
            (Working, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == AgentStatus::Dead
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Unknown => "Unknown",
            AgentStatus::Idle => "Idle",
            AgentStatus::Pending => "Pending",
            AgentStatus::Working => "Working",
            AgentStatus::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// 世界坐标（执行器上报，核心不解释）
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// 物品 -> 数量
pub type Inventory = BTreeMap<String, u64>;

/// 单个 Agent 的状态记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub name: String,
    pub status: AgentStatus,
    pub position: Option<Position>,
    pub inventory: Inventory,
    pub last_task: Option<String>,
    pub last_success: bool,
    pub last_critique: String,
    /// Dispatcher 发送成功后置位，Worker 消费命令时清除
    pub has_pending_task: bool,
    pub pending_task: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentStatus::Unknown,
            position: None,
            inventory: Inventory::new(),
            last_task: None,
            last_success: false,
            last_critique: String::new(),
            has_pending_task: false,
            pending_task: None,
            updated_at: Utc::now(),
        }
    }

    /// 可接收新命令：空闲且没有待消费命令
    pub fn is_dispatchable(&self) -> bool {
        self.status == AgentStatus::Idle && !self.has_pending_task
    }
}

/// 状态字段的更新方式
#[derive(Clone, Debug, PartialEq)]
pub enum StatusChange {
    /// 直接设置
    Set(AgentStatus),
    /// 执行器视角的状态：若为 Idle 且存在待消费命令，则对外显示为 Pending
    Reported(AgentStatus),
    /// 仅当当前状态属于 `from` 时才设置，否则忽略（补丁其余字段照常生效）
    Guarded {
        from: Vec<AgentStatus>,
        to: AgentStatus,
    },
}

/// 执行器上报的遥测字段（均可缺省）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    pub position: Option<Position>,
    pub inventory: Option<Inventory>,
    pub last_task: Option<String>,
    pub last_success: Option<bool>,
    pub last_critique: Option<String>,
}

/// 部分字段更新；由 StateStore::merge 作为一个整体原子应用
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentStatePatch {
    pub status: Option<StatusChange>,
    pub position: Option<Position>,
    pub inventory: Option<Inventory>,
    pub last_task: Option<String>,
    pub last_success: Option<bool>,
    pub last_critique: Option<String>,
    pub has_pending_task: Option<bool>,
    pub pending_task: Option<Option<String>>,
    /// 仅当当前 pending_task 等于该值时才清除待消费标记
    pub clear_pending_if: Option<Option<String>>,
}

impl AgentStatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(StatusChange::Set(status));
        self
    }

    pub fn reported_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(StatusChange::Reported(status));
        self
    }

    pub fn status_if(mut self, from: &[AgentStatus], to: AgentStatus) -> Self {
        self.status = Some(StatusChange::Guarded {
            from: from.to_vec(),
            to,
        });
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        if telemetry.position.is_some() {
            self.position = telemetry.position;
        }
        if telemetry.inventory.is_some() {
            self.inventory = telemetry.inventory;
        }
        if telemetry.last_task.is_some() {
            self.last_task = telemetry.last_task;
        }
        if telemetry.last_success.is_some() {
            self.last_success = telemetry.last_success;
        }
        if telemetry.last_critique.is_some() {
            self.last_critique = telemetry.last_critique;
        }
        self
    }

    /// 只取位置与背包；任务结果字段由 Worker 自己写入
    pub fn live_telemetry(mut self, telemetry: Telemetry) -> Self {
        if telemetry.position.is_some() {
            self.position = telemetry.position;
        }
        if telemetry.inventory.is_some() {
            self.inventory = telemetry.inventory;
        }
        self
    }

    pub fn last_task(mut self, task: impl Into<String>) -> Self {
        self.last_task = Some(task.into());
        self
    }

    pub fn outcome(mut self, success: bool, critique: impl Into<String>) -> Self {
        self.last_success = Some(success);
        self.last_critique = Some(critique.into());
        self
    }

    pub fn pending(mut self, task: impl Into<String>) -> Self {
        self.has_pending_task = Some(true);
        self.pending_task = Some(Some(task.into()));
        self
    }

    pub fn clear_pending(mut self) -> Self {
        self.has_pending_task = Some(false);
        self.pending_task = Some(None);
        self
    }

    /// 条件清除：期间若被重新标记为其他任务则保留
    pub fn clear_pending_if(mut self, expected: Option<String>) -> Self {
        self.clear_pending_if = Some(expected);
        self
    }

    fn guard_clears(&self, current: &AgentState) -> bool {
        self.clear_pending_if
            .as_ref()
            .is_some_and(|expected| *expected == current.pending_task)
    }

    /// 计算补丁应用后的状态；None 表示状态不变
    pub(crate) fn resolve_status(&self, current: &AgentState) -> Option<AgentStatus> {
        let has_pending = if self.guard_clears(current) {
            false
        } else {
            self.has_pending_task.unwrap_or(current.has_pending_task)
        };
        match self.status.as_ref()? {
            StatusChange::Set(s) => Some(*s),
            StatusChange::Reported(AgentStatus::Idle) if has_pending => Some(AgentStatus::Pending),
            StatusChange::Reported(s) => Some(*s),
            StatusChange::Guarded { from, to } => from.contains(&current.status).then_some(*to),
        }
    }

    /// 在已校验的前提下写入字段
    pub(crate) fn apply_to(self, state: &mut AgentState, status: Option<AgentStatus>) {
        if self.guard_clears(state) {
            state.has_pending_task = false;
            state.pending_task = None;
        }
        if let Some(s) = status {
            state.status = s;
        }
        if let Some(p) = self.position {
            state.position = Some(p);
        }
        if let Some(inv) = self.inventory {
            state.inventory = inv;
        }
        if let Some(t) = self.last_task {
            state.last_task = Some(t);
        }
        if let Some(ok) = self.last_success {
            state.last_success = ok;
        }
        if let Some(c) = self.last_critique {
            state.last_critique = c;
        }
        if let Some(p) = self.has_pending_task {
            state.has_pending_task = p;
        }
        if let Some(t) = self.pending_task {
            state.pending_task = t;
        }
        state.updated_at = Utc::now();
    }
}

/// 某一时刻所有 Agent 状态的不可变副本
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    taken_at: DateTime<Utc>,
    agents: BTreeMap<String, AgentState>,
}

impl Snapshot {
    pub fn new(agents: BTreeMap<String, AgentState>) -> Self {
        Self {
            taken_at: Utc::now(),
            agents,
        }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, name: &str) -> Option<&AgentState> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AgentState)> {
        self.agents.iter()
    }

    /// 状态报告：name -> status
    pub fn status_report(&self) -> BTreeMap<String, AgentStatus> {
        self.agents
            .iter()
            .map(|(name, st)| (name.clone(), st.status))
            .collect()
    }

    /// 合并全体背包：按物品逐项相加
    pub fn merged_inventory(&self) -> Inventory {
        let mut total = Inventory::new();
        for state in self.agents.values() {
            for (item, count) in &state.inventory {
                *total.entry(item.clone()).or_insert(0) += count;
            }
        }
        total
    }

    pub fn idle_agents(&self) -> Vec<&str> {
        self.agents
            .values()
            .filter(|s| s.status == AgentStatus::Idle)
            .map(|s| s.name.as_str())
            .collect()
    }
}
