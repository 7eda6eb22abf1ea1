//! Task Executor：每个 Agent 的外部执行能力
//!
//! reset / get_state / run 三个操作；传输细节由实现决定（HTTP、内存 Mock）。

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::Telemetry;

pub use http::HttpTaskExecutor;
pub use mock::MockTaskExecutor;

/// 执行器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// 任务本身失败（可在本地记录后继续）
    #[error("{0}")]
    Task(String),

    /// 执行器不可达、超时、环境步进错误
    #[error("{0}")]
    Transient(String),

    /// 无法恢复
    #[error("{0}")]
    Fatal(String),
}

/// 环境重置方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    Soft,
    Hard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOptions {
    pub mode: ResetMode,
    /// 重置后等待环境稳定的 tick 数
    pub wait_ticks: u32,
}

impl ResetOptions {
    pub fn soft(wait_ticks: u32) -> Self {
        Self {
            mode: ResetMode::Soft,
            wait_ticks,
        }
    }
}

/// 任务结果附带信息
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub success: bool,
    #[serde(default)]
    pub critique: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// run 的返回
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    #[serde(default)]
    pub transcript: Vec<serde_json::Value>,
    #[serde(default)]
    pub reward: f64,
    #[serde(default)]
    pub done: bool,
    pub info: TaskInfo,
}

impl TaskOutcome {
    pub fn succeeded() -> Self {
        Self {
            done: true,
            info: TaskInfo {
                success: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn unsuccessful(critique: impl Into<String>) -> Self {
        Self {
            done: true,
            info: TaskInfo {
                success: false,
                critique: Some(critique.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Task Executor 接口
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 重置环境，返回初始观察
    async fn reset(&self, options: ResetOptions) -> Result<serde_json::Value, ExecutorError>;

    /// 当前遥测
    async fn get_state(&self) -> Result<Telemetry, ExecutorError>;

    /// 执行一个长任务（同一 Agent 同时只会有一个）
    async fn run(
        &self,
        task: &str,
        context: &str,
        reset_env_first: bool,
    ) -> Result<TaskOutcome, ExecutorError>;
}
