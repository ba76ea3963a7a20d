//! 多 Agent 执行层：Planner / Navigator / Validator 与执行循环
//!
//! 每个 Agent 一次模型调用、一个确定性兜底；模型调用与取消令牌竞速。

pub mod decode;
pub mod loop_;
pub mod navigator;
pub mod planner;
pub mod types;
pub mod validator;

pub use decode::{decode_json, decode_or, extract_json_object};
pub use loop_::{ExecutionLoop, LoopConfig};
pub use navigator::{fallback_decision, find_url, validate_decision, Navigator, NavigatorDecision};
pub use planner::{Plan, Planner};
pub use types::{ExecutionRecord, StepContext, TaskOutcome, TaskResult};
pub use validator::{ValidationPolicy, Validator, Verdict};

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{AgentRole, CallOptions, LlmClient};
use crate::memory::Message;

/// 调用模型；取消令牌先触发时返回 Cancelled
pub(crate) async fn call_agent_llm(
    llm: &dyn LlmClient,
    messages: &[Message],
    options: &CallOptions,
    role: AgentRole,
    cancel: &CancellationToken,
) -> Result<String, AgentError> {
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        result = llm.call(messages, options, role) => result.map_err(AgentError::from),
    }
}
