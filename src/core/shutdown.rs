//! 关闭流程
//!
//! 关闭的来源有三个：Ctrl+C、SIGTERM、舰队全员 Dead。
//! 第一个到达的原因生效，之后的触发只是重复取消。
//! 触发后 Dispatcher 与各 Worker 在两步之间退出，正在执行的任务有一段宽限期，
//! 最后依次运行清理任务（输出每个 Agent 的最终状态）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::store::StateStore;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 舰队无法继续运行
    FatalError(String),
}

impl ShutdownReason {
    /// 进程应以失败退出
    pub fn is_failure(&self) -> bool {
        matches!(self, ShutdownReason::FatalError(_))
    }
}

/// 取消 token + 关闭原因广播
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// Dispatcher 与 Worker 共用的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；已关闭时忽略，保留最初的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.token.is_cancelled() {
            tracing::debug!("Shutdown already in progress, ignoring {:?}", reason);
            return;
        }
        tracing::info!("Shutting down: {:?}", reason);
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与（unix 下）SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM");
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler not installed: {}", e),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 退出前执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每个清理有独立超时
pub struct ShutdownCoordinator {
    cleanups: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanups: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanups.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        for task in &self.cleanups {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::debug!("Cleanup '{}' done", name),
                Ok(Err(e)) => tracing::warn!("Cleanup '{}' failed: {}", name, e),
                Err(_) => tracing::warn!("Cleanup '{}' timed out after {:?}", name, self.timeout),
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 退出前记录每个 Agent 的最终状态
pub struct FleetStateReport {
    store: Arc<dyn StateStore>,
}

impl FleetStateReport {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for FleetStateReport {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let snapshot = self.store.snapshot().await;
        for (name, state) in snapshot.iter() {
            tracing::info!(
                agent = %name,
                "Final state: status={}, last_task={:?}, last_success={}, critique={:?}",
                state.status,
                state.last_task,
                state.last_success,
                state.last_critique
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FleetStateReport"
    }
}

/// 运行 app 直到它结束或关闭被触发；触发后给 app `grace` 时间收尾，然后执行清理。
///
/// 返回触发关闭的原因；app 自行结束且无人触发关闭时返回 None。
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    grace: Duration,
    cleanup: impl FnOnce() -> Fut,
) -> Option<ShutdownReason>
where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    let mut reasons = manager.subscribe();
    manager.install_signal_handlers();

    tokio::pin!(app);
    tokio::select! {
        _ = &mut app => {
            tracing::info!("Fleet run finished");
        }
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Waiting up to {:?} for in-flight work", grace);
            if tokio::time::timeout(grace, &mut app).await.is_err() {
                tracing::warn!("Grace period elapsed, exiting with work in flight");
            }
        }
    }

    cleanup().await;
    reasons.try_recv().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        let token = manager.token();

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::FatalError("every agent is dead".into()));

        assert!(token.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), ShutdownReason::Signal);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_only_fatal_error_is_failure() {
        assert!(ShutdownReason::FatalError("x".into()).is_failure());
        assert!(!ShutdownReason::UserInitiated.is_failure());
        assert!(!ShutdownReason::Signal.is_failure());
    }

    struct FlagCleanup(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "FlagCleanup"
        }
    }

    struct StuckCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for StuckCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "StuckCleanup"
        }
    }

    #[tokio::test]
    async fn test_stuck_cleanup_does_not_block_the_rest() {
        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_millis(20));
        coordinator.register(StuckCleanup);
        coordinator.register(FlagCleanup(called.clone()));

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_app() {
        let manager = Arc::new(ShutdownManager::new());
        let token = manager.token();
        let finished = Arc::new(AtomicBool::new(false));
        let cleaned = Arc::new(AtomicBool::new(false));

        let app_finished = finished.clone();
        let app = async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            app_finished.store(true, Ordering::SeqCst);
        };
        let trigger = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.shutdown(ShutdownReason::Signal);
        });

        let cleanup_flag = cleaned.clone();
        let reason = run_with_graceful_shutdown(manager, app, Duration::from_secs(1), || async move {
            cleanup_flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert_eq!(reason, Some(ShutdownReason::Signal));
        assert!(finished.load(Ordering::SeqCst));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fatal_reason_from_app_is_returned() {
        let manager = Arc::new(ShutdownManager::new());
        let inner = manager.clone();
        let app = async move {
            inner.shutdown(ShutdownReason::FatalError("every agent is dead".into()));
        };

        let reason = run_with_graceful_shutdown(manager, app, Duration::from_secs(1), || async {}).await;
        assert_eq!(
            reason,
            Some(ShutdownReason::FatalError("every agent is dead".into()))
        );
    }

    #[tokio::test]
    async fn test_app_finishing_alone_has_no_reason() {
        let manager = Arc::new(ShutdownManager::new());
        let reason = run_with_graceful_shutdown(manager, async {}, Duration::from_secs(1), || async {}).await;
        assert_eq!(reason, None);
    }

    #[tokio::test]
    async fn test_fleet_state_report_cleanup() {
        let store = Arc::new(crate::core::store::InMemoryStateStore::new());
        store.register("Voyager_Miner").await;
        let report = FleetStateReport::new(store);
        assert!(report.cleanup().await.is_ok());
        assert_eq!(report.name(), "FleetStateReport");
    }
}
