//! Dispatcher：固定间隔轮询的协调循环
//!
//! 每轮：取快照 -> 全员到齐且至少一个 Idle 才规划 -> 逐条按最新状态复核 -> 先置待消费标记，再替换邮箱内容。
//! 标记在发送之前写入，Worker 取走命令后清除标记的顺序因此总是成立；发送失败则回滚标记。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::mailbox::{Command, MailboxSender};
use crate::core::state::{AgentStatePatch, AgentStatus};
use crate::core::store::StateStore;
use crate::planner::{Assignment, PlannerBrain, TaskOrder};

/// 一轮调度的结果（日志与测试用）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// 本轮是否调用了 Planner
    pub planned: bool,
    pub dispatched: Vec<String>,
    pub skipped: Vec<String>,
    /// 全部 Agent 已 Dead
    pub fleet_dead: bool,
}

/// 协调者：独占所有邮箱的生产端
pub struct Dispatcher {
    goal: String,
    expected: Vec<String>,
    mailboxes: HashMap<String, MailboxSender>,
    store: Arc<dyn StateStore>,
    planner: Arc<dyn PlannerBrain>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        goal: impl Into<String>,
        store: Arc<dyn StateStore>,
        planner: Arc<dyn PlannerBrain>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            goal: goal.into(),
            expected: Vec::new(),
            mailboxes: HashMap::new(),
            store,
            planner,
            poll_interval,
        }
    }

    /// 登记一个期望成员及其邮箱生产端
    pub fn add_agent(&mut self, name: impl Into<String>, mailbox: MailboxSender) {
        let name = name.into();
        if !self.expected.contains(&name) {
            self.expected.push(name.clone());
        }
        self.mailboxes.insert(name, mailbox);
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    /// 轮询直到取消或全员 Dead
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "Dispatcher started: goal={:?}, agents={:?}",
            self.goal,
            self.expected
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let report = self.run_cycle().await;
            if report.fleet_dead {
                tracing::error!("Every agent is dead, dispatcher stopping");
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    /// 执行一轮调度
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let snapshot = self.store.snapshot().await;

        let missing: Vec<&str> = self
            .expected
            .iter()
            .filter(|name| !snapshot.contains(name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            tracing::debug!("Waiting for agents to come online: {:?}", missing);
            return report;
        }

        if !self.expected.is_empty()
            && self.expected.iter().all(|name| {
                snapshot
                    .get(name)
                    .is_some_and(|st| st.status == AgentStatus::Dead)
            })
        {
            report.fleet_dead = true;
            return report;
        }

        if snapshot.idle_agents().is_empty() {
            tracing::debug!("No idle agents, skipping planning");
            return report;
        }

        let status = snapshot.status_report();
        let inventory = snapshot.merged_inventory();
        tracing::debug!("Team status: {:?}", status);
        let plan = self.planner.create_plan(&self.goal, &status, &inventory).await;
        report.planned = true;
        if !plan.thought.is_empty() {
            tracing::info!("Planner thought: {}", plan.thought);
        }

        for (name, order) in plan.tasks() {
            if self.dispatch(name, order).await {
                report.dispatched.push(name.clone());
            } else {
                report.skipped.push(name.clone());
            }
        }
        report
    }

    /// 派发单条指令，返回是否成功写入邮箱
    async fn dispatch(&self, name: &str, order: &TaskOrder) -> bool {
        let Some(mailbox) = self.mailboxes.get(name) else {
            tracing::warn!(agent = %name, "Plan names an unknown agent, skipping");
            return false;
        };

        // 快照可能已过期，按最新状态复核
        match self.store.get(name).await {
            Ok(state) if state.is_dispatchable() => {}
            Ok(state) => {
                tracing::debug!(
                    agent = %name,
                    "Not dispatchable (status={}, pending={}), skipping",
                    state.status,
                    state.has_pending_task
                );
                return false;
            }
            Err(e) => {
                tracing::warn!(agent = %name, "State lookup failed: {}", e);
                return false;
            }
        }

        let mark = AgentStatePatch::new()
            .pending(order.task.clone())
            .status_if(&[AgentStatus::Idle, AgentStatus::Unknown], AgentStatus::Pending);
        if let Err(e) = self.store.merge(name, mark).await {
            tracing::warn!(agent = %name, "Could not mark pending: {}", e);
            return false;
        }

        match mailbox.replace(Command::new(Assignment::Task(order.clone()))) {
            Ok(stale) => {
                if let Some(stale) = stale {
                    tracing::info!(agent = %name, "Replaced stale command: {}", stale.assignment);
                }
                tracing::info!(agent = %name, "Dispatched: {} ({})", order.task, order.purpose);
                true
            }
            Err(e) => {
                tracing::warn!(agent = %name, "Dispatch abandoned: {}", e);
                let rollback = AgentStatePatch::new()
                    .clear_pending()
                    .status_if(&[AgentStatus::Pending], AgentStatus::Idle);
                if let Err(e) = self.store.merge(name, rollback).await {
                    tracing::debug!(agent = %name, "Pending rollback not applied: {}", e);
                }
                false
            }
        }
    }
}
