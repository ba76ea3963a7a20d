//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::call；失败统一归类为 LlmError 的四种类型，
//! 由 RetryingLlmClient 据此决定重试、切换 provider 或直接抛出。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;

/// 发起调用的 Agent 角色（用于日志与按角色选参）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Navigator,
    Validator,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Planner => write!(f, "planner"),
            AgentRole::Navigator => write!(f, "navigator"),
            AgentRole::Validator => write!(f, "validator"),
        }
    }
}

/// 单次调用参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub temperature: Option<f32>,
}

impl CallOptions {
    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }
}

/// LLM 调用错误：调用方只会看到这四类，不暴露具体厂商的错误结构
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Token limit exceeded: {0}")]
    TokenLimitExceeded(String),

    #[error("LLM error: {0}")]
    Other(String),
}

/// 错误类别（不含消息体）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    Overloaded,
    RateLimited,
    TokenLimitExceeded,
    Other,
}

const TOKEN_LIMIT_MARKERS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "maximum context",
    "token limit",
    "too many tokens",
    "max_tokens",
];

const OVERLOADED_MARKERS: &[&str] = &[
    "overloaded",
    "529",
    "503",
    "service unavailable",
    "server is busy",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "too many requests",
    "quota",
];

impl LlmError {
    /// 按已知标记把原始错误文本归类；token 超限优先判断（"too many tokens" 不能被当作限流）
    pub fn classify(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let lower = raw.to_lowercase();
        if TOKEN_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::TokenLimitExceeded(raw)
        } else if OVERLOADED_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::Overloaded(raw)
        } else if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::RateLimited(raw)
        } else {
            LlmError::Other(raw)
        }
    }

    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::Overloaded(_) => LlmErrorKind::Overloaded,
            LlmError::RateLimited(_) => LlmErrorKind::RateLimited,
            LlmError::TokenLimitExceeded(_) => LlmErrorKind::TokenLimitExceeded,
            LlmError::Other(_) => LlmErrorKind::Other,
        }
    }

    /// 未归类的 Other 再按标记识别一次（兼容不做分类的后端）
    pub fn reclassified(self) -> Self {
        match self {
            LlmError::Other(raw) => Self::classify(raw),
            classified => classified,
        }
    }

    /// 同一 provider 上可退避重试
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Overloaded(_) | LlmError::RateLimited(_))
    }
}

/// LLM 客户端 trait：单次非流式调用
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        messages: &[Message],
        options: &CallOptions,
        role: AgentRole,
    ) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
