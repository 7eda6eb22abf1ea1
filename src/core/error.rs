//! 错误类型与恢复动作
//!
//! FleetError 是 Worker 循环内部的失败分类；与 RecoveryEngine 配合决定记录后继续 / 软重置 / 终止。

use thiserror::Error;

use crate::core::state::AgentStatus;
use crate::executor::ExecutorError;

/// StateStore 错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Agent not found: {0}")]
    UnknownAgent(String),

    #[error("Agent {0} is dead, no further updates accepted")]
    Terminal(String),

    #[error("Invalid status transition for {agent}: {from} -> {to}")]
    InvalidTransition {
        agent: String,
        from: AgentStatus,
        to: AgentStatus,
    },
}

/// Worker 循环中的失败分类
#[derive(Error, Debug)]
pub enum FleetError {
    /// 任务本身失败或报告未成功：本地记录后继续
    #[error("Task failed: {0}")]
    TaskFailure(String),

    /// 执行器不可达、环境步进错误、邮箱或状态存储错误：尝试一次软恢复
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    /// 握手失败、恢复失败或执行器报告致命错误：Agent 进入 Dead
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl From<ExecutorError> for FleetError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Task(msg) => FleetError::TaskFailure(msg),
            ExecutorError::Transient(msg) => FleetError::Infrastructure(msg),
            ExecutorError::Fatal(msg) => FleetError::Fatal(msg),
        }
    }
}

impl From<StateError> for FleetError {
    fn from(err: StateError) -> Self {
        FleetError::Infrastructure(format!("state store: {err}"))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 写入 last_critique 后回到 Idle，循环照常
    RecordAndContinue(String),
    /// 软重置执行器环境，限时等待稳定
    SoftReset,
    /// 标记 Dead 并退出循环
    Abort(String),
}
