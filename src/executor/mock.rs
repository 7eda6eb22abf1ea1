//! Mock Task Executor（用于测试与无远端进程的演示）
//!
//! 可预置 run 结果、注入 get_state / reset 失败；成功的任务会把任务名作为物品加入背包。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::state::{Inventory, Position, Telemetry};
use crate::executor::{ExecutorError, ResetOptions, TaskExecutor, TaskOutcome};

/// 一次 run 调用的记录
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRecord {
    pub task: String,
    pub context: String,
    pub reset_env_first: bool,
}

#[derive(Debug, Default)]
struct MockWorld {
    inventory: Inventory,
    last_task: Option<String>,
    last_success: Option<bool>,
    last_critique: Option<String>,
}

/// 脚本化执行器
#[derive(Debug, Default)]
pub struct MockTaskExecutor {
    world: Mutex<MockWorld>,
    script: Mutex<VecDeque<Result<TaskOutcome, ExecutorError>>>,
    runs: Mutex<Vec<RunRecord>>,
    state_failures: AtomicUsize,
    reset_failures: AtomicUsize,
    resets: AtomicUsize,
    run_delay: Duration,
}

impl MockTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, item: &str, count: u64) -> Self {
        self.world
            .get_mut()
            .inventory
            .insert(item.to_string(), count);
        self
    }

    /// 追加一个预置的 run 结果；脚本耗尽后 run 默认成功
    pub fn script_run(mut self, result: Result<TaskOutcome, ExecutorError>) -> Self {
        self.script.get_mut().push_back(result);
        self
    }

    /// 接下来 n 次 get_state 失败（Transient）
    pub fn fail_next_states(self, n: usize) -> Self {
        self.fail_states(n);
        self
    }

    /// 接下来 n 次 reset 失败（Transient）；usize::MAX 表示永远失败
    pub fn fail_next_resets(self, n: usize) -> Self {
        self.fail_resets(n);
        self
    }

    /// 运行中注入 get_state 失败
    pub fn fail_states(&self, n: usize) {
        self.state_failures.store(n, Ordering::SeqCst);
    }

    /// 运行中注入 reset 失败
    pub fn fail_resets(&self, n: usize) {
        self.reset_failures.store(n, Ordering::SeqCst);
    }

    /// 模拟长任务耗时
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().await.clone()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// 计数器大于 0 时减一并返回 true
    fn consume_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl TaskExecutor for MockTaskExecutor {
    async fn reset(&self, options: ResetOptions) -> Result<serde_json::Value, ExecutorError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if Self::consume_failure(&self.reset_failures) {
            return Err(ExecutorError::Transient("mock reset refused".to_string()));
        }
        Ok(serde_json::json!({
            "event": "observe",
            "mode": options.mode,
            "wait_ticks": options.wait_ticks,
        }))
    }

    async fn get_state(&self) -> Result<Telemetry, ExecutorError> {
        if Self::consume_failure(&self.state_failures) {
            return Err(ExecutorError::Transient("mock executor unreachable".to_string()));
        }
        let world = self.world.lock().await;
        Ok(Telemetry {
            position: Some(Position {
                x: 0.0,
                y: 64.0,
                z: 0.0,
            }),
            inventory: Some(world.inventory.clone()),
            last_task: world.last_task.clone(),
            last_success: world.last_success,
            last_critique: world.last_critique.clone(),
        })
    }

    async fn run(
        &self,
        task: &str,
        context: &str,
        reset_env_first: bool,
    ) -> Result<TaskOutcome, ExecutorError> {
        self.runs.lock().await.push(RunRecord {
            task: task.to_string(),
            context: context.to_string(),
            reset_env_first,
        });
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }

        let scripted = self.script.lock().await.pop_front();
        let result = scripted.unwrap_or_else(|| Ok(TaskOutcome::succeeded()));

        let mut world = self.world.lock().await;
        world.last_task = Some(task.to_string());
        match &result {
            Ok(outcome) => {
                world.last_success = Some(outcome.info.success);
                world.last_critique = outcome.info.critique.clone();
                if outcome.info.success {
                    *world.inventory.entry(task.to_string()).or_insert(0) += 1;
                }
            }
            Err(e) => {
                world.last_success = Some(false);
                world.last_critique = Some(e.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_run_succeeds_and_grows_inventory() {
        let exec = MockTaskExecutor::new().with_item("log", 2);
        let outcome = exec.run("mine_iron", "Order: need ore", true).await.unwrap();
        assert!(outcome.info.success);

        let state = exec.get_state().await.unwrap();
        let inv = state.inventory.unwrap();
        assert_eq!(inv["log"], 2);
        assert_eq!(inv["mine_iron"], 1);
        assert_eq!(state.last_task.as_deref(), Some("mine_iron"));

        let runs = exec.runs().await;
        assert_eq!(runs.len(), 1);
        assert!(runs[0].reset_env_first);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let exec = MockTaskExecutor::new().fail_next_states(1).fail_next_resets(1);
        assert!(exec.get_state().await.is_err());
        assert!(exec.get_state().await.is_ok());
        assert!(exec.reset(ResetOptions::soft(40)).await.is_err());
        assert!(exec.reset(ResetOptions::soft(40)).await.is_ok());
        assert_eq!(exec.reset_count(), 2);
    }

    #[tokio::test]
    async fn test_failures_injected_while_shared() {
        let exec = std::sync::Arc::new(MockTaskExecutor::new());
        assert!(exec.reset(ResetOptions::soft(40)).await.is_ok());
        exec.fail_resets(1);
        exec.fail_states(1);
        assert!(exec.reset(ResetOptions::soft(40)).await.is_err());
        assert!(exec.get_state().await.is_err());
        assert!(exec.get_state().await.is_ok());
    }

    #[tokio::test]
    async fn test_permanent_reset_failure() {
        let exec = MockTaskExecutor::new().fail_next_resets(usize::MAX);
        for _ in 0..3 {
            assert!(exec.reset(ResetOptions::soft(40)).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_scripted_results_in_order() {
        let exec = MockTaskExecutor::new()
            .script_run(Err(ExecutorError::Task("fell in lava".into())))
            .script_run(Ok(TaskOutcome::unsuccessful("no iron nearby")));
        assert_eq!(
            exec.run("a", "", true).await.unwrap_err(),
            ExecutorError::Task("fell in lava".into())
        );
        assert!(!exec.run("b", "", true).await.unwrap().info.success);
        assert!(exec.run("c", "", true).await.unwrap().info.success);
    }
}
