//! Worker 监管状态机：每个 Agent 一个
//!
//! Sense -> Listen -> Act -> Sense ...；任何一步的基础设施错误进入 Recover，
//! 恢复成功回到 Sense，失败进入 Dead 并退出。握手（软重置环境 + 首次 get_state）失败直接 Dead，不重试。
//! 取消只在两步之间检查，不会打断正在执行的长任务。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::error::{FleetError, RecoveryAction};
use crate::core::mailbox::{Command, MailboxReceiver};
use crate::core::recovery::RecoveryEngine;
use crate::core::state::{AgentStatePatch, AgentStatus};
use crate::core::store::StateStore;
use crate::executor::TaskExecutor;

/// 状态机的一步
#[derive(Debug)]
enum Step {
    /// 拉取遥测并发布
    Sense,
    /// 等待邮箱命令
    Listen,
    /// 执行命令
    Act(Command),
    /// 任务失败：记录后回到 Idle
    Record(String),
    /// 基础设施错误：软重置
    Recover(FleetError),
    /// 终止
    Dead(String),
}

/// Worker 退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// 已标记 Dead
    Dead(String),
    /// 收到关闭信号
    Cancelled,
}

/// 单个 Agent 的监管者：独占自己的执行器与邮箱消费端
pub struct WorkerSupervisor {
    name: String,
    executor: Arc<dyn TaskExecutor>,
    store: Arc<dyn StateStore>,
    mailbox: MailboxReceiver,
    recovery: RecoveryEngine,
    receive_timeout: Duration,
}

impl WorkerSupervisor {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn StateStore>,
        mailbox: MailboxReceiver,
        recovery: RecoveryEngine,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            executor,
            store,
            mailbox,
            recovery,
            receive_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 运行到 Dead 或取消
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerExit {
        self.store.register(&self.name).await;

        if let Err(e) = self.handshake().await {
            let reason = format!("Fatal before loop: {e}");
            self.mark_dead(&reason).await;
            return WorkerExit::Dead(reason);
        }
        tracing::info!(agent = %self.name, "Worker online");

        let mut step = Step::Sense;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(agent = %self.name, "Worker stopping on shutdown");
                return WorkerExit::Cancelled;
            }

            step = match step {
                Step::Sense => match self.sense().await {
                    Ok(()) => Step::Listen,
                    Err(e) => self.on_error(e),
                },
                Step::Listen => {
                    let received = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::info!(agent = %self.name, "Worker stopping on shutdown");
                            return WorkerExit::Cancelled;
                        }
                        r = self.mailbox.receive(self.receive_timeout) => r,
                    };
                    match received {
                        Ok(Some(command)) => Step::Act(command),
                        Ok(None) => Step::Sense,
                        Err(e) => Step::Recover(FleetError::Infrastructure(e.to_string())),
                    }
                }
                Step::Act(command) => match self.act(command).await {
                    Ok(()) => Step::Sense,
                    Err(e) => self.on_error(e),
                },
                Step::Record(critique) => match self.record_failure(&critique).await {
                    Ok(()) => Step::Sense,
                    Err(e) => self.on_error(e),
                },
                Step::Recover(err) => self.recover(err).await,
                Step::Dead(reason) => {
                    self.mark_dead(&reason).await;
                    return WorkerExit::Dead(reason);
                }
            };
        }
    }

    fn on_error(&self, err: FleetError) -> Step {
        match self.recovery.handle(&err) {
            RecoveryAction::RecordAndContinue(critique) => {
                tracing::warn!(agent = %self.name, "Task failed: {}", critique);
                Step::Record(critique)
            }
            RecoveryAction::SoftReset => Step::Recover(err),
            RecoveryAction::Abort(reason) => Step::Dead(format!("Fatal: {reason}")),
        }
    }

    /// 软重置环境，首次取遥测并上线为 Idle
    async fn handshake(&self) -> Result<(), FleetError> {
        self.recovery.soft_reset(self.executor.as_ref()).await?;
        let telemetry = self.executor.get_state().await?;
        self.store
            .merge(
                &self.name,
                AgentStatePatch::new()
                    .telemetry(telemetry)
                    .reported_status(AgentStatus::Idle),
            )
            .await?;
        Ok(())
    }

    async fn sense(&self) -> Result<(), FleetError> {
        let telemetry = self.executor.get_state().await?;
        let state = self
            .store
            .merge(
                &self.name,
                AgentStatePatch::new()
                    .live_telemetry(telemetry)
                    .reported_status(AgentStatus::Idle),
            )
            .await?;
        tracing::debug!(agent = %self.name, status = %state.status, "Sensed");
        Ok(())
    }

    async fn act(&self, command: Command) -> Result<(), FleetError> {
        let Some(order) = command.task().cloned() else {
            tracing::debug!(agent = %self.name, "Received {} sentinel", command.assignment);
            let telemetry = self.executor.get_state().await?;
            self.store
                .merge(
                    &self.name,
                    AgentStatePatch::new()
                        .clear_pending()
                        .live_telemetry(telemetry)
                        .reported_status(AgentStatus::Idle),
                )
                .await?;
            return Ok(());
        };

        self.store
            .merge(
                &self.name,
                AgentStatePatch::new()
                    .clear_pending()
                    .status(AgentStatus::Working)
                    .last_task(order.task.clone()),
            )
            .await?;
        tracing::info!(agent = %self.name, "Executing task: {} ({})", order.task, order.purpose);

        let context = format!("Order: {}", order.purpose);
        let outcome = self.executor.run(&order.task, &context, true).await?;
        if !outcome.info.success {
            let critique = outcome
                .info
                .critique
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| format!("Task {} reported unsuccessful", order.task));
            return Err(FleetError::TaskFailure(critique));
        }

        self.store
            .merge(
                &self.name,
                AgentStatePatch::new()
                    .status(AgentStatus::Idle)
                    .outcome(true, outcome.info.critique.unwrap_or_default()),
            )
            .await?;
        tracing::info!(agent = %self.name, "Task {} completed", order.task);

        let telemetry = self.executor.get_state().await?;
        self.store
            .merge(&self.name, AgentStatePatch::new().live_telemetry(telemetry))
            .await?;
        Ok(())
    }

    async fn record_failure(&self, critique: &str) -> Result<(), FleetError> {
        self.store
            .merge(
                &self.name,
                AgentStatePatch::new()
                    .status(AgentStatus::Idle)
                    .outcome(false, critique),
            )
            .await?;
        Ok(())
    }

    async fn recover(&self, err: FleetError) -> Step {
        tracing::warn!(agent = %self.name, "Attempting soft recovery after: {}", err);

        if self.mailbox.is_closed() {
            return Step::Dead("Recover failed: mailbox closed".to_string());
        }
        let marked = match self.store.get(&self.name).await {
            Ok(state) => state.pending_task,
            Err(e) => return Step::Dead(format!("Recover failed: {e}")),
        };
        if let Err(e) = self.recovery.soft_reset(self.executor.as_ref()).await {
            return Step::Dead(format!("Recover failed: {e}"));
        }

        let mut patch = AgentStatePatch::new();
        match self.executor.get_state().await {
            Ok(telemetry) => patch = patch.live_telemetry(telemetry),
            Err(e) => {
                tracing::warn!(agent = %self.name, "Post-recovery state fetch failed: {}", e);
            }
        }
        patch = patch
            .status(AgentStatus::Idle)
            .outcome(false, format!("Recovered from error: {err}"));
        // 邮箱为空时，仅当标记仍是重置前那条才清除
        if self.mailbox.is_empty() {
            patch = patch.clear_pending_if(marked);
        }
        if let Err(e) = self.store.merge(&self.name, patch).await {
            return Step::Dead(format!("Recover failed: {e}"));
        }
        tracing::info!(agent = %self.name, "Recovered, back to Idle");
        Step::Sense
    }

    async fn mark_dead(&self, reason: &str) {
        tracing::error!(agent = %self.name, "Agent is dead: {}", reason);
        let patch = AgentStatePatch::new()
            .status(AgentStatus::Dead)
            .outcome(false, reason)
            .clear_pending();
        if let Err(e) = self.store.merge(&self.name, patch).await {
            tracing::debug!(agent = %self.name, "Dead marker not written: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mailbox::{mailbox, MailboxSender};
    use crate::core::state::AgentState;
    use crate::core::store::InMemoryStateStore;
    use crate::executor::{ExecutorError, MockTaskExecutor, TaskOutcome};
    use crate::planner::Assignment;

    const TIMEOUT: Duration = Duration::from_secs(3);

    struct Harness {
        store: Arc<InMemoryStateStore>,
        exec: Arc<MockTaskExecutor>,
        tx: MailboxSender,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<WorkerExit>,
    }

    fn start(exec: MockTaskExecutor) -> Harness {
        let store = Arc::new(InMemoryStateStore::new());
        let exec = Arc::new(exec);
        let (tx, rx) = mailbox();
        let cancel = CancellationToken::new();
        let supervisor = WorkerSupervisor::new(
            "Voyager_Miner",
            exec.clone(),
            store.clone(),
            rx,
            RecoveryEngine::new(40, Duration::from_millis(200)),
            Duration::from_millis(20),
        );
        let handle = tokio::spawn(supervisor.run(cancel.clone()));
        Harness {
            store,
            exec,
            tx,
            cancel,
            handle,
        }
    }

    async fn wait_for(
        store: &InMemoryStateStore,
        pred: impl Fn(&AgentState) -> bool,
    ) -> AgentState {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Ok(st) = store.get("Voyager_Miner").await {
                if pred(&st) {
                    return st;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn dispatch(h: &Harness, task: &str) {
        h.store
            .merge(
                "Voyager_Miner",
                AgentStatePatch::new()
                    .pending(task)
                    .status_if(&[AgentStatus::Idle], AgentStatus::Pending),
            )
            .await
            .unwrap();
        h.tx.replace(Command::order(task, "need ore")).unwrap();
    }

    #[tokio::test]
    async fn test_handshake_failure_is_dead_without_retry() {
        let h = start(MockTaskExecutor::new().fail_next_states(1));
        let exit = tokio::time::timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Dead(ref r) if r.starts_with("Fatal before loop")));
        let st = h.store.get("Voyager_Miner").await.unwrap();
        assert_eq!(st.status, AgentStatus::Dead);
        assert!(st.last_critique.contains("Fatal before loop"));
        assert_eq!(h.exec.reset_count(), 1);
    }

    #[tokio::test]
    async fn test_handshake_resets_environment_first() {
        let h = start(MockTaskExecutor::new());
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;
        assert_eq!(h.exec.reset_count(), 1);
        assert!(h.exec.runs().await.is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_handshake_reset_failure_is_dead() {
        let h = start(MockTaskExecutor::new().fail_next_resets(1));
        let exit = tokio::time::timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Dead(ref r) if r.starts_with("Fatal before loop")));
        let st = h.store.get("Voyager_Miner").await.unwrap();
        assert_eq!(st.status, AgentStatus::Dead);
        assert!(!st.last_success);
        assert_eq!(h.exec.reset_count(), 1);
    }

    #[tokio::test]
    async fn test_task_runs_and_returns_to_idle() {
        let h = start(MockTaskExecutor::new());
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        dispatch(&h, "mine_iron").await;
        wait_for(&h.store, |s| s.inventory.contains_key("mine_iron")).await;
        let st = wait_for(&h.store, |s| s.status == AgentStatus::Idle && s.last_success).await;
        assert!(!st.has_pending_task);
        assert!(st.pending_task.is_none());
        assert_eq!(st.last_task.as_deref(), Some("mine_iron"));

        let runs = h.exec.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].context, "Order: need ore");
        assert!(runs[0].reset_env_first);

        h.cancel.cancel();
        assert_eq!(h.handle.await.unwrap(), WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn test_task_failure_keeps_worker_alive() {
        let h = start(
            MockTaskExecutor::new().script_run(Err(ExecutorError::Task("fell in lava".into()))),
        );
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        dispatch(&h, "mine_iron").await;
        let st = wait_for(&h.store, |s| s.last_critique == "fell in lava").await;
        assert_eq!(st.status, AgentStatus::Idle);
        assert!(!st.last_success);
        assert!(!h.handle.is_finished());
        assert_eq!(h.exec.reset_count(), 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unsuccessful_outcome_is_task_failure() {
        let h = start(
            MockTaskExecutor::new().script_run(Ok(TaskOutcome::unsuccessful("no iron nearby"))),
        );
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        dispatch(&h, "mine_iron").await;
        let st = wait_for(&h.store, |s| s.last_critique == "no iron nearby").await;
        assert_eq!(st.status, AgentStatus::Idle);
        assert!(!st.last_success);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_infrastructure_failure_recovers_to_idle() {
        let h = start(
            MockTaskExecutor::new()
                .script_run(Err(ExecutorError::Transient("env step error".into()))),
        );
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        dispatch(&h, "mine_iron").await;
        let st = wait_for(&h.store, |s| s.last_critique.starts_with("Recovered from error")).await;
        assert_eq!(st.status, AgentStatus::Idle);
        assert!(!st.last_success);
        assert!(!st.has_pending_task);
        assert_eq!(h.exec.reset_count(), 2);

        // 恢复后仍能接收并执行下一条命令
        dispatch(&h, "craft_table").await;
        wait_for(&h.store, |s| s.inventory.contains_key("craft_table")).await;
        assert_eq!(h.exec.runs().await.len(), 2);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_recovery_is_dead() {
        let h = start(
            MockTaskExecutor::new()
                .script_run(Err(ExecutorError::Transient("env step error".into()))),
        );
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;
        h.exec.fail_resets(usize::MAX);

        dispatch(&h, "mine_iron").await;
        let exit = tokio::time::timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Dead(ref r) if r.starts_with("Recover failed")));
        let st = h.store.get("Voyager_Miner").await.unwrap();
        assert_eq!(st.status, AgentStatus::Dead);
        assert!(st.last_critique.starts_with("Recover failed"));
    }

    #[tokio::test]
    async fn test_fatal_executor_error_skips_recovery() {
        let h = start(
            MockTaskExecutor::new().script_run(Err(ExecutorError::Fatal("bot crashed".into()))),
        );
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        dispatch(&h, "mine_iron").await;
        let exit = tokio::time::timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Dead(_)));
        assert_eq!(h.exec.reset_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_clears_pending_marker() {
        let h = start(MockTaskExecutor::new());
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        h.store
            .merge(
                "Voyager_Miner",
                AgentStatePatch::new()
                    .pending("mine_iron")
                    .status_if(&[AgentStatus::Idle], AgentStatus::Pending),
            )
            .await
            .unwrap();
        h.exec.fail_resets(usize::MAX);
        h.exec.fail_states(usize::MAX);

        let exit = tokio::time::timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert!(matches!(exit, WorkerExit::Dead(ref r) if r.starts_with("Recover failed")));
        let st = h.store.get("Voyager_Miner").await.unwrap();
        assert_eq!(st.status, AgentStatus::Dead);
        assert!(!st.has_pending_task);
        assert!(st.pending_task.is_none());
        assert!(!st.last_success);
    }

    #[tokio::test]
    async fn test_recovery_after_success_records_failed_outcome() {
        let h = start(MockTaskExecutor::new());
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        dispatch(&h, "mine_iron").await;
        wait_for(&h.store, |s| s.status == AgentStatus::Idle && s.last_success).await;

        h.exec.fail_states(1);
        let st = wait_for(&h.store, |s| s.last_critique.starts_with("Recovered from error")).await;
        assert_eq!(st.status, AgentStatus::Idle);
        assert!(!st.last_success);
        assert!(!h.handle.is_finished());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_sentinel_clears_pending_without_running() {
        let h = start(MockTaskExecutor::new());
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        h.store
            .merge(
                "Voyager_Miner",
                AgentStatePatch::new()
                    .pending("wait")
                    .status_if(&[AgentStatus::Idle], AgentStatus::Pending),
            )
            .await
            .unwrap();
        h.tx.replace(Command::new(Assignment::Wait)).unwrap();

        let st = wait_for(&h.store, |s| !s.has_pending_task).await;
        assert_eq!(st.status, AgentStatus::Idle);
        assert!(h.exec.runs().await.is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_closed_mailbox_ends_in_dead() {
        let h = start(MockTaskExecutor::new());
        wait_for(&h.store, |s| s.status == AgentStatus::Idle).await;

        drop(h.tx);
        let exit = tokio::time::timeout(TIMEOUT, h.handle).await.unwrap().unwrap();
        assert_eq!(
            exit,
            WorkerExit::Dead("Recover failed: mailbox closed".to_string())
        );
    }
}
