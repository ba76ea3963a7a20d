//! Mock / Scripted LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：按角色返回固定 JSON，使一次任务走完 Plan -> Navigate(done) -> Validate
//! - ScriptedLlmClient：按队列（可按角色）吐出预设结果并记录调用时刻，便于断言重试与退避

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::llm::{AgentRole, CallOptions, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：离线跑通完整流程
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(
        &self,
        messages: &[Message],
        _options: &CallOptions,
        role: AgentRole,
    ) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let preview: String = last_user.chars().take(80).collect();

        let out = match role {
            AgentRole::Planner => serde_json::json!({
                "observation": "Mock planner has no page insight",
                "done": false,
                "challenges": "",
                "next_steps": "finish the task",
                "reasoning": format!("offline mock for: {}", preview),
            }),
            AgentRole::Navigator => serde_json::json!({
                "action": "done",
                "params": { "text": "Mock run finished" },
                "intent": "finish",
            }),
            AgentRole::Validator => serde_json::json!({
                "is_valid": true,
                "confidence": 1.0,
                "reason": "mock validator accepts every result",
                "answer": "Mock run finished",
            }),
        };
        Ok(out.to_string())
    }
}

type Scripted = Result<String, LlmError>;

/// 脚本化客户端：优先消费对应角色的队列，其次公共队列；都为空时返回 Other
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    shared: Mutex<VecDeque<Scripted>>,
    by_role: Mutex<HashMap<AgentRole, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(AgentRole, Instant)>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.push(Ok(text.into()));
    }

    pub fn push_err(&self, err: LlmError) {
        self.push(Err(err));
    }

    fn push(&self, item: Scripted) {
        if let Ok(mut q) = self.shared.lock() {
            q.push_back(item);
        }
    }

    pub fn push_role_ok(&self, role: AgentRole, text: impl Into<String>) {
        self.push_role(role, Ok(text.into()));
    }

    pub fn push_role_err(&self, role: AgentRole, err: LlmError) {
        self.push_role(role, Err(err));
    }

    fn push_role(&self, role: AgentRole, item: Scripted) {
        if let Ok(mut map) = self.by_role.lock() {
            map.entry(role).or_default().push_back(item);
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn role_call_count(&self, role: AgentRole) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(r, _)| *r == role).count())
            .unwrap_or(0)
    }

    /// 每次调用发生的时刻（tokio 时钟，可配合 start_paused 精确断言）
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(_, t)| *t).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn call(
        &self,
        _messages: &[Message],
        _options: &CallOptions,
        role: AgentRole,
    ) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((role, Instant::now()));
        }
        let from_role = self
            .by_role
            .lock()
            .ok()
            .and_then(|mut map| map.get_mut(&role).and_then(|q| q.pop_front()));
        if let Some(item) = from_role {
            return item;
        }
        self.shared
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(LlmError::Other(format!("script exhausted for {}", role))))
    }
}
