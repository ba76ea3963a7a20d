//! 错误类型
//!
//! - AgentError：执行循环与各 Agent 内部使用；只有 Cancelled 会从 Agent 冒泡到循环，其余在 Agent 内部兜底
//! - TaskManagerError：任务生命周期管理的准入与参数错误
//! - GatewayError：监听、握手、序列化与投递错误

use thiserror::Error;

use crate::llm::LlmError;

/// 执行循环中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 取消令牌已触发；不属于 LLM 错误，单独一类
    #[error("Task cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

/// 任务管理器拒绝请求的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskManagerError {
    #[error("Task input is empty")]
    EmptyInput,

    #[error("Task already running: {0}")]
    AlreadyRunning(String),

    /// 已结束的任务不能用同一 id 重新启动
    #[error("Task already finished: {0}")]
    AlreadyFinished(String),

    #[error("Too many running tasks (limit {0})")]
    CapacityExceeded(usize),
}

/// 网关与广播层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind: {0}")]
    Bind(String),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Connection not found: {0}")]
    UnknownConnection(String),

    #[error("Send to {0} failed")]
    SendFailed(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialize(e.to_string())
    }
}
