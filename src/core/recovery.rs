//! 错误恢复引擎
//!
//! 根据 FleetError 类型返回 RecoveryAction，供 Worker 状态机决定是记录后继续、软重置还是终止；
//! 软重置本身也在这里执行（限时等待环境稳定）。

use std::time::Duration;

use crate::core::error::{FleetError, RecoveryAction};
use crate::executor::{ResetOptions, TaskExecutor};

/// 语义化错误恢复：将错误映射为可执行动作，并负责执行软重置
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    reset_wait_ticks: u32,
    settle_timeout: Duration,
}

impl RecoveryEngine {
    pub fn new(reset_wait_ticks: u32, settle_timeout: Duration) -> Self {
        Self {
            reset_wait_ticks,
            settle_timeout,
        }
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &FleetError) -> RecoveryAction {
        match err {
            FleetError::TaskFailure(msg) => RecoveryAction::RecordAndContinue(msg.clone()),
            FleetError::Infrastructure(_) => RecoveryAction::SoftReset,
            FleetError::Fatal(msg) => RecoveryAction::Abort(msg.clone()),
        }
    }

    /// 软重置执行器环境；超过 settle_timeout 视为失败
    pub async fn soft_reset(&self, executor: &dyn TaskExecutor) -> Result<(), FleetError> {
        let options = ResetOptions::soft(self.reset_wait_ticks);
        match tokio::time::timeout(self.settle_timeout, executor.reset(options)).await {
            Ok(Ok(_observation)) => Ok(()),
            Ok(Err(e)) => Err(FleetError::Fatal(format!("soft reset failed: {e}"))),
            Err(_) => Err(FleetError::Fatal(format!(
                "soft reset did not settle within {:?}",
                self.settle_timeout
            ))),
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(40, Duration::from_secs(30))
    }
}
