//! Planner：观察当前页面与历史，给出下一步计划或宣布完成
//!
//! 模型调用或解码失败时退回确定性计划（done=false），任务继续；只有取消会向上返回。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::decode::{decode_or, lenient_bool, lenient_string};
use super::{call_agent_llm, StepContext};
use crate::core::AgentError;
use crate::llm::{AgentRole, CallOptions, LlmClient};
use crate::memory::Message;

const SYSTEM_PROMPT: &str = r#"You are the planner of a browser automation agent.
Look at the task, the current page and the previous actions, then decide what should happen next.
If the task is already accomplished, set "done" to true and put the answer in "observation".
Reply with a single JSON object:
{"observation": "...", "done": false, "challenges": "...", "next_steps": "...", "reasoning": "..."}"#;

/// Planner 输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, deserialize_with = "lenient_string")]
    pub observation: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub done: bool,
    #[serde(default, deserialize_with = "lenient_string")]
    pub challenges: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub next_steps: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub reasoning: String,
}

impl Plan {
    /// 模型不可用时的确定性计划：继续执行原任务
    pub fn fallback(task: &str, reason: &str) -> Self {
        Self {
            observation: format!("Planner unavailable: {}", reason),
            done: false,
            challenges: reason.to_string(),
            next_steps: task.to_string(),
            reasoning: "fallback plan".to_string(),
        }
    }

    /// 记录与 prompt 中使用的一行摘要
    pub fn summary(&self) -> String {
        if self.next_steps.is_empty() {
            self.observation.clone()
        } else {
            self.next_steps.clone()
        }
    }
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    options: CallOptions,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            options: CallOptions::default().with_temperature(0.2),
        }
    }

    /// 除取消外不返回错误
    pub async fn plan(&self, ctx: &StepContext<'_>, cancel: &CancellationToken) -> Result<Plan, AgentError> {
        let messages = vec![Message::system(SYSTEM_PROMPT), Message::user(ctx.render())];
        let call = call_agent_llm(
            self.llm.as_ref(),
            &messages,
            &self.options,
            AgentRole::Planner,
            cancel,
        )
        .await;
        match call {
            Ok(raw) => Ok(decode_or(&raw, |e| Plan::fallback(ctx.task, &e.to_string()))),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(step = ctx.step, error = %e, "planner failed, using fallback plan");
                Ok(Plan::fallback(ctx.task, &e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::PageState;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::MemoryContext;

    fn ctx<'a>(state: &'a PageState, memory: &'a MemoryContext) -> StepContext<'a> {
        StepContext {
            task: "find the pricing page",
            step: 1,
            max_steps: 15,
            state,
            history: &[],
            memory,
            max_elements: 50,
        }
    }

    #[tokio::test]
    async fn test_plan_decodes_model_output() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_ok("```json\n{\"observation\": \"on home\", \"done\": \"false\", \"next_steps\": \"open pricing\"}\n```");
        let planner = Planner::new(llm);
        let (state, memory) = (PageState::empty(), MemoryContext::default());
        let plan = planner.plan(&ctx(&state, &memory), &CancellationToken::new()).await.unwrap();
        assert!(!plan.done);
        assert_eq!(plan.next_steps, "open pricing");
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back_to_not_done() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_err(LlmError::Other("down".into()));
        let planner = Planner::new(llm);
        let (state, memory) = (PageState::empty(), MemoryContext::default());
        let plan = planner.plan(&ctx(&state, &memory), &CancellationToken::new()).await.unwrap();
        assert!(!plan.done);
        assert_eq!(plan.next_steps, "find the pricing page");
    }

    #[tokio::test]
    async fn test_garbage_output_falls_back() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_ok("I am not sure what to do");
        let planner = Planner::new(llm);
        let (state, memory) = (PageState::empty(), MemoryContext::default());
        let plan = planner.plan(&ctx(&state, &memory), &CancellationToken::new()).await.unwrap();
        assert!(!plan.done);
        assert!(plan.observation.starts_with("Planner unavailable"));
    }

    #[tokio::test]
    async fn test_cancel_propagates() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_ok(r#"{"done": true}"#);
        let planner = Planner::new(llm.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (state, memory) = (PageState::empty(), MemoryContext::default());
        let err = planner.plan(&ctx(&state, &memory), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(llm.call_count(), 0);
    }
}
