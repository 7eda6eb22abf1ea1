//! 舰队编排器：主控入口
//!
//! 负责：按配置选择 LLM 后端、构建 Planner 与每个 Agent 的执行器，
//! 为每个 Agent 启动一个隔离的 WorkerSupervisor（错峰启动、panic 不外溢），
//! 并运行 Dispatcher 直到关闭信号或全员 Dead。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ExecutorKind};
use crate::core::dispatcher::Dispatcher;
use crate::core::mailbox::mailbox;
use crate::core::recovery::RecoveryEngine;
use crate::core::state::{AgentStatePatch, AgentStatus};
use crate::core::store::{InMemoryStateStore, StateStore};
use crate::core::supervisor::{WorkerExit, WorkerSupervisor};
use crate::executor::{HttpTaskExecutor, MockTaskExecutor, TaskExecutor};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::planner::{LlmPlanner, PlannerBrain};

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::default());
    }
    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(create_deepseek_client(
            Some(&model),
            cfg.llm.base_url.as_deref(),
        ))
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::default())
    }
}

/// 按 [fleet].executor 为单个 Agent 构建执行器
pub fn create_executor(
    kind: ExecutorKind,
    endpoint: &str,
    request_timeout: Duration,
) -> anyhow::Result<Arc<dyn TaskExecutor>> {
    match kind {
        ExecutorKind::Http => {
            let exec = HttpTaskExecutor::new(endpoint, request_timeout)
                .with_context(|| format!("executor for {endpoint}"))?;
            Ok(Arc::new(exec))
        }
        ExecutorKind::Mock => Ok(Arc::new(MockTaskExecutor::new())),
    }
}

/// 舰队成员：名称 + 独占的执行器
pub struct FleetMember {
    pub name: String,
    pub executor: Arc<dyn TaskExecutor>,
}

impl FleetMember {
    pub fn new(name: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
        }
    }
}

/// 运行参数（由 AppConfig 派生，测试中可直接构造）
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub goal: String,
    pub poll_interval: Duration,
    pub receive_timeout: Duration,
    pub reset_wait_ticks: u32,
    pub settle_timeout: Duration,
    pub startup_stagger: Duration,
}

impl FleetSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            goal: cfg.fleet.goal.clone(),
            poll_interval: cfg.dispatcher.poll_interval(),
            receive_timeout: cfg.worker.receive_timeout(),
            reset_wait_ticks: cfg.worker.reset_wait_ticks,
            settle_timeout: cfg.worker.settle_timeout(),
            startup_stagger: Duration::from_secs(cfg.fleet.startup_stagger_secs),
        }
    }
}

/// 舰队运行结束时每个 Worker 的退出原因
#[derive(Debug, Default)]
pub struct FleetReport {
    pub exits: BTreeMap<String, WorkerExit>,
}

impl FleetReport {
    pub fn dead_count(&self) -> usize {
        self.exits
            .values()
            .filter(|e| matches!(e, WorkerExit::Dead(_)))
            .count()
    }

    /// 全员 Dead（空舰队不算）
    pub fn all_dead(&self) -> bool {
        !self.exits.is_empty() && self.dead_count() == self.exits.len()
    }
}

/// 一个 Dispatcher + 每个 Agent 一个 Supervisor
pub struct Fleet {
    settings: FleetSettings,
    store: Arc<dyn StateStore>,
    planner: Arc<dyn PlannerBrain>,
    members: Vec<FleetMember>,
}

impl Fleet {
    pub fn new(
        settings: FleetSettings,
        store: Arc<dyn StateStore>,
        planner: Arc<dyn PlannerBrain>,
        members: Vec<FleetMember>,
    ) -> Self {
        Self {
            settings,
            store,
            planner,
            members,
        }
    }

    /// 从配置构建：校验成员、选择 LLM、加载提示词、创建执行器
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        cfg.validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid fleet configuration")?;

        let llm = create_llm_from_config(cfg);
        let planner = LlmPlanner::from_config(
            llm,
            &cfg.planner,
            Duration::from_secs(cfg.llm.timeouts.request),
        );

        let mut members = Vec::with_capacity(cfg.fleet.agents.len());
        for agent in &cfg.fleet.agents {
            let executor = create_executor(
                cfg.fleet.executor,
                &agent.endpoint,
                cfg.worker.request_timeout(),
            )?;
            members.push(FleetMember::new(agent.name.clone(), executor));
        }

        Ok(Self::new(
            FleetSettings::from_config(cfg),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(planner),
            members,
        ))
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// 启动所有 Worker 与 Dispatcher，运行到取消或全员 Dead
    pub async fn run(self, cancel: CancellationToken) -> FleetReport {
        let fleet_cancel = cancel.child_token();
        let mut dispatcher = Dispatcher::new(
            self.settings.goal.clone(),
            self.store.clone(),
            self.planner.clone(),
            self.settings.poll_interval,
        );
        let recovery =
            RecoveryEngine::new(self.settings.reset_wait_ticks, self.settings.settle_timeout);

        let mut workers = JoinSet::new();
        for (index, member) in self.members.into_iter().enumerate() {
            let (tx, rx) = mailbox();
            dispatcher.add_agent(member.name.clone(), tx);

            let supervisor = WorkerSupervisor::new(
                member.name.clone(),
                member.executor,
                self.store.clone(),
                rx,
                recovery.clone(),
                self.settings.receive_timeout,
            );
            let delay = self.settings.startup_stagger * index as u32;
            workers.spawn(contain(
                member.name,
                supervisor,
                self.store.clone(),
                delay,
                fleet_cancel.clone(),
            ));
        }

        dispatcher.run(fleet_cancel.clone()).await;
        fleet_cancel.cancel();

        let mut report = FleetReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((name, exit)) => {
                    report.exits.insert(name, exit);
                }
                Err(e) => tracing::error!("Worker wrapper failed: {}", e),
            }
        }
        tracing::info!(
            "Fleet stopped: {} workers, {} dead",
            report.exits.len(),
            report.dead_count()
        );
        report
    }
}

/// 在独立任务中运行 Supervisor；panic 时将该 Agent 标记为 Dead，不影响其他 Agent 与 Dispatcher
async fn contain(
    name: String,
    supervisor: WorkerSupervisor,
    store: Arc<dyn StateStore>,
    delay: Duration,
    cancel: CancellationToken,
) -> (String, WorkerExit) {
    if !delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return (name, WorkerExit::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!(agent = %name, "Launching worker");

    match tokio::spawn(supervisor.run(cancel)).await {
        Ok(exit) => (name, exit),
        Err(e) => {
            let reason = format!("Worker crashed: {e}");
            tracing::error!(agent = %name, "{}", reason);
            store.register(&name).await;
            let patch = AgentStatePatch::new()
                .status(AgentStatus::Dead)
                .outcome(false, reason.clone())
                .clear_pending();
            if let Err(e) = store.merge(&name, patch).await {
                tracing::debug!(agent = %name, "Dead marker not written: {}", e);
            }
            (name, WorkerExit::Dead(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::config::AgentEndpoint;
    use crate::core::state::Telemetry;
    use crate::executor::{ExecutorError, ResetOptions, TaskOutcome};
    use crate::planner::Plan;

    struct WaitPlanner;

    #[async_trait]
    impl PlannerBrain for WaitPlanner {
        async fn create_plan(
            &self,
            _goal: &str,
            status: &BTreeMap<String, AgentStatus>,
            _inventory: &crate::core::state::Inventory,
        ) -> Plan {
            Plan::all_wait(status.keys().cloned())
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn reset(&self, _: ResetOptions) -> Result<serde_json::Value, ExecutorError> {
            Ok(serde_json::Value::Null)
        }

        async fn get_state(&self) -> Result<Telemetry, ExecutorError> {
            panic!("executor state corrupted");
        }

        async fn run(&self, _: &str, _: &str, _: bool) -> Result<TaskOutcome, ExecutorError> {
            Ok(TaskOutcome::succeeded())
        }
    }

    fn settings() -> FleetSettings {
        FleetSettings {
            goal: "Build a iron pickaxe".into(),
            poll_interval: Duration::from_millis(20),
            receive_timeout: Duration::from_millis(20),
            reset_wait_ticks: 40,
            settle_timeout: Duration::from_millis(200),
            startup_stagger: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_is_contained() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let fleet = Fleet::new(
            settings(),
            store.clone(),
            Arc::new(WaitPlanner),
            vec![
                FleetMember::new("Broken", Arc::new(PanickingExecutor)),
                FleetMember::new("Healthy", Arc::new(MockTaskExecutor::new())),
            ],
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fleet.run(cancel.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let snap = store.snapshot().await;
            let broken = snap.get("Broken").map(|s| s.status);
            let healthy = snap.get("Healthy").map(|s| s.status);
            if broken == Some(AgentStatus::Dead) && healthy == Some(AgentStatus::Idle) {
                assert!(snap
                    .get("Broken")
                    .is_some_and(|s| s.last_critique.starts_with("Worker crashed")));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "fleet did not settle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.exits["Healthy"], WorkerExit::Cancelled);
        assert!(matches!(report.exits["Broken"], WorkerExit::Dead(_)));
    }

    #[tokio::test]
    async fn test_fleet_stops_when_every_agent_is_dead() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let fleet = Fleet::new(
            settings(),
            store,
            Arc::new(WaitPlanner),
            vec![
                FleetMember::new("A", Arc::new(MockTaskExecutor::new().fail_next_states(1))),
                FleetMember::new("B", Arc::new(PanickingExecutor)),
            ],
        );
        let report = tokio::time::timeout(Duration::from_secs(3), fleet.run(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(report.dead_count(), 2);
        assert!(report.all_dead());
    }

    #[tokio::test]
    async fn test_from_config_with_mock_executor() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        cfg.fleet.executor = ExecutorKind::Mock;
        cfg.fleet.agents = vec![AgentEndpoint {
            name: "Voyager_Miner".into(),
            endpoint: "http://127.0.0.1:3000".into(),
        }];
        let fleet = Fleet::from_config(&cfg).unwrap();
        assert_eq!(fleet.members.len(), 1);
        assert_eq!(fleet.settings.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_from_config_rejects_empty_fleet() {
        let err = Fleet::from_config(&AppConfig::default()).err().unwrap();
        assert!(format!("{err:#}").contains("fleet.agents is empty"));
    }
}
