//! Hive - 多 Agent 舰队协调核心
//!
//! 入口：初始化日志、加载配置、构建舰队，运行到全员 Dead 或收到 Ctrl+C / SIGTERM。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{
    run_with_graceful_shutdown, Fleet, FleetStateReport, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};

/// 收到关闭信号后等待正在执行的任务收尾的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    // 显式配置文件：HIVE_CONFIG=path/to/fleet.toml
    let config_path = std::env::var_os("HIVE_CONFIG").map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    tracing::info!(
        "{} starting: goal={:?}, {} agents",
        cfg.app.name.as_deref().unwrap_or("hive"),
        cfg.fleet.goal,
        cfg.fleet.agents.len()
    );

    let fleet = Fleet::from_config(&cfg).context("Failed to build fleet")?;
    let store = fleet.store();

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_secs(5));
    coordinator.register(FleetStateReport::new(store));

    let token = shutdown.token();
    let trigger = shutdown.clone();
    let app = async move {
        let report = fleet.run(token).await;
        if report.all_dead() {
            trigger.shutdown(ShutdownReason::FatalError("every agent is dead".to_string()));
        }
    };

    let reason = run_with_graceful_shutdown(shutdown, app, SHUTDOWN_GRACE, || async {
        coordinator.run_cleanup().await;
    })
    .await;

    match reason {
        Some(reason) if reason.is_failure() => anyhow::bail!("Fleet stopped: {:?}", reason),
        Some(reason) => tracing::info!("Stopped: {:?}", reason),
        None => tracing::info!("Stopped"),
    }
    Ok(())
}
