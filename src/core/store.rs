//! 状态存储：全舰队唯一的共享资源
//!
//! 只暴露 register / get / merge / snapshot；merge 按字段原子应用，从不整体替换记录，
//! 因此 Worker 与 Dispatcher 同时写入不相交字段时不会互相覆盖。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::error::StateError;
use crate::core::state::{AgentState, AgentStatePatch, Snapshot};

/// 状态存储接口
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 注册 Agent（Unknown 初始状态）；已存在时返回现有记录
    async fn register(&self, name: &str) -> AgentState;

    async fn get(&self, name: &str) -> Result<AgentState, StateError>;

    /// 原子应用补丁，返回应用后的记录
    async fn merge(&self, name: &str, patch: AgentStatePatch) -> Result<AgentState, StateError>;

    /// 同一时刻所有 Agent 的一致副本
    async fn snapshot(&self) -> Snapshot;
}

/// 内存实现（tokio RwLock）
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    agents: RwLock<HashMap<String, AgentState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn register(&self, name: &str) -> AgentState {
        let mut agents = self.agents.write().await;
        agents
            .entry(name.to_string())
            .or_insert_with(|| AgentState::new(name))
            .clone()
    }

    async fn get(&self, name: &str) -> Result<AgentState, StateError> {
        self.agents
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::UnknownAgent(name.to_string()))
    }

    async fn merge(&self, name: &str, patch: AgentStatePatch) -> Result<AgentState, StateError> {
        let mut agents = self.agents.write().await;
        let state = agents
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownAgent(name.to_string()))?;

        if state.status.is_terminal() {
            return Err(StateError::Terminal(name.to_string()));
        }

        let next = patch.resolve_status(state);
        if let Some(to) = next {
            if !state.status.can_transition_to(to) {
                return Err(StateError::InvalidTransition {
                    agent: name.to_string(),
                    from: state.status,
                    to,
                });
            }
        }

        patch.apply_to(state, next);
        Ok(state.clone())
    }

    async fn snapshot(&self) -> Snapshot {
        let agents = self.agents.read().await;
        let copy: BTreeMap<String, AgentState> = agents
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Snapshot::new(copy)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::state::{AgentStatus, Inventory, Telemetry};

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = InMemoryStateStore::new();
        let first = store.register("Miner").await;
        assert_eq!(first.status, AgentStatus::Unknown);

        store
            .merge("Miner", AgentStatePatch::new().status(AgentStatus::Idle))
            .await
            .unwrap();
        let again = store.register("Miner").await;
        assert_eq!(again.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_merge_unknown_agent_fails() {
        let store = InMemoryStateStore::new();
        let err = store
            .merge("ghost", AgentStatePatch::new().status(AgentStatus::Idle))
            .await
            .unwrap_err();
        assert_eq!(err, StateError::UnknownAgent("ghost".into()));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected_as_whole() {
        let store = InMemoryStateStore::new();
        store.register("a").await;
        let err = store
            .merge(
                "a",
                AgentStatePatch::new()
                    .status(AgentStatus::Working)
                    .last_task("mine_iron"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        let st = store.get("a").await.unwrap();
        assert_eq!(st.status, AgentStatus::Unknown);
        assert!(st.last_task.is_none());
    }

    #[tokio::test]
    async fn test_dead_is_terminal() {
        let store = InMemoryStateStore::new();
        store.register("a").await;
        store
            .merge("a", AgentStatePatch::new().status(AgentStatus::Dead))
            .await
            .unwrap();
        let err = store
            .merge("a", AgentStatePatch::new().status(AgentStatus::Idle))
            .await
            .unwrap_err();
        assert_eq!(err, StateError::Terminal("a".into()));
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_merges_do_not_lose_updates() {
        let store = Arc::new(InMemoryStateStore::new());
        store.register("a").await;
        store
            .merge("a", AgentStatePatch::new().status(AgentStatus::Idle))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..50u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let mut inv = Inventory::new();
                    inv.insert("log".into(), i);
                    store
                        .merge(
                            "a",
                            AgentStatePatch::new().telemetry(Telemetry {
                                inventory: Some(inv),
                                ..Default::default()
                            }),
                        )
                        .await
                        .unwrap();
                } else {
                    store
                        .merge("a", AgentStatePatch::new().pending(format!("task_{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let st = store.get("a").await.unwrap();
        assert!(st.has_pending_task);
        assert!(st.pending_task.is_some());
        assert!(st.inventory.contains_key("log"));
        assert_eq!(st.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_merges() {
        let store = InMemoryStateStore::new();
        store.register("a").await;
        let snap = store.snapshot().await;
        store
            .merge("a", AgentStatePatch::new().status(AgentStatus::Idle))
            .await
            .unwrap();
        assert_eq!(snap.get("a").unwrap().status, AgentStatus::Unknown);
    }
}
