//! WebPilot - Rust 浏览器智能体编排核心
//!
//! 模块划分：
//! - **agents**: Planner / Navigator / Validator 与多 Agent 执行循环
//! - **browser**: 页面状态提供者、动作注册表与内置动作（可选 Headless Chrome）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、任务准入、任务生命周期管理、优雅关闭
//! - **gateway**: 客户端协议、连接与广播层、WebSocket 服务
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、重试与轮转
//! - **memory**: 对话消息与程序记忆

pub mod agents;
pub mod browser;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;

pub use agents::{ExecutionLoop, LoopConfig, TaskOutcome, TaskResult};
pub use core::{TaskManager, TaskManagerConfig};
pub use gateway::Broadcaster;

use std::sync::Arc;

use browser::{ActionRegistry, StateProvider};

/// 按配置组装执行循环：provider 列表、动作注册表与页面状态来源
pub fn build_execution_loop(cfg: &config::AppConfig) -> Result<ExecutionLoop, llm::LlmError> {
    let llm = Arc::new(llm::create_llm_from_config(&cfg.llm)?);
    let (registry, state) = build_browser(cfg);
    Ok(ExecutionLoop::new(llm, registry, state, LoopConfig::from_config(cfg)))
}

#[cfg(feature = "browser")]
fn build_browser(cfg: &config::AppConfig) -> (ActionRegistry, Arc<dyn StateProvider>) {
    let session = browser::ChromeSession::new(cfg.browser.headless, cfg.browser.max_elements);
    let mut registry = ActionRegistry::with_builtins();
    session.register_actions(&mut registry);
    (registry, Arc::new(session))
}

#[cfg(not(feature = "browser"))]
fn build_browser(_cfg: &config::AppConfig) -> (ActionRegistry, Arc<dyn StateProvider>) {
    tracing::warn!("built without the browser feature, only wait/done actions are available");
    (ActionRegistry::with_builtins(), Arc::new(browser::EmptyStateProvider))
}
