//! WebPilot 网关
//!
//! 入口：初始化日志、加载配置、组装执行循环与任务管理器，启动 WebSocket 网关直到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use webpilot::config::load_config;
use webpilot::core::{ShutdownCoordinator, ShutdownManager, TaskManagerCleanup};
use webpilot::gateway::GatewayServer;
use webpilot::{build_execution_loop, Broadcaster, TaskManager, TaskManagerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    webpilot::observability::init();

    // 可选：第一个参数为配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let executor = Arc::new(build_execution_loop(&cfg).context("Failed to configure LLM providers")?);
    let broadcaster = Arc::new(Broadcaster::new(cfg.gateway.pending_capacity));
    let manager = TaskManager::new(TaskManagerConfig::from_section(&cfg.tasks), broadcaster);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let server = GatewayServer::new(cfg.gateway.bind_addr.clone(), manager.clone(), executor);
    server
        .run(shutdown.token())
        .await
        .context("Gateway failed")?;

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(TaskManagerCleanup::new(manager));
    coordinator.run_cleanup().await;
    tracing::info!(reason = ?shutdown.reason(), "WebPilot stopped");
    Ok(())
}
