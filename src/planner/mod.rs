//! Planner Brain：把目标 + 队伍状态 + 共享背包变成每个 Agent 的指令
//!
//! create_plan 不返回错误：LLM 调用失败、超时或输出无法解析时，退化为对输入中每个 Agent 都 wait。

pub mod plan;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::PlannerSection;
use crate::core::state::{AgentStatus, Inventory};
use crate::llm::{LlmClient, Message};

pub use plan::{extract_json, parse_plan, Assignment, Plan, TaskOrder};

/// Planner 内部错误（不会越过 create_plan）
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed plan: {0}")]
    Malformed(String),
}

/// Planner Brain 接口
#[async_trait]
pub trait PlannerBrain: Send + Sync {
    async fn create_plan(
        &self,
        goal: &str,
        status: &BTreeMap<String, AgentStatus>,
        inventory: &Inventory,
    ) -> Plan;
}

/// 基于 LLM 的 Planner
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    timeout: Duration,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            timeout,
        }
    }

    /// 按 [planner] 配置加载基础提示词与技能索引
    pub fn from_config(llm: Arc<dyn LlmClient>, cfg: &PlannerSection, timeout: Duration) -> Self {
        let base = prompts::load_base_prompt(cfg.prompt_path.as_deref());
        let skills = prompts::load_skills(cfg.skills_path.as_deref());
        tracing::info!(
            "Planner loaded skills: {}",
            skills.chars().take(200).collect::<String>()
        );
        Self::new(llm, prompts::render_system_prompt(&base, &skills), timeout)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub fn build_messages(
        &self,
        goal: &str,
        status: &BTreeMap<String, AgentStatus>,
        inventory: &Inventory,
    ) -> Vec<Message> {
        vec![
            Message::system(self.system_prompt.clone()),
            Message::user(prompts::render_user_message(goal, status, inventory)),
        ]
    }

    async fn try_plan(
        &self,
        goal: &str,
        status: &BTreeMap<String, AgentStatus>,
        inventory: &Inventory,
    ) -> Result<Plan, PlannerError> {
        let messages = self.build_messages(goal, status, inventory);
        let output = tokio::time::timeout(self.timeout, self.llm.complete(&messages))
            .await
            .map_err(|_| PlannerError::Timeout(self.timeout))?
            .map_err(PlannerError::Llm)?;
        parse_plan(&output)
    }
}

#[async_trait]
impl PlannerBrain for LlmPlanner {
    async fn create_plan(
        &self,
        goal: &str,
        status: &BTreeMap<String, AgentStatus>,
        inventory: &Inventory,
    ) -> Plan {
        match self.try_plan(goal, status, inventory).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("Planning failed ({}), every agent waits this cycle", e);
                Plan::all_wait(status.keys().cloned())
            }
        }
    }
}
