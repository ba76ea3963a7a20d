//! Validator：done 信号之后判断任务是否真的完成
//!
//! 一个实现，由 ValidationPolicy 决定置信度门槛与 prompt 的严格程度。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::decode::{decode_or, lenient_bool, lenient_string};
use super::{call_agent_llm, StepContext};
use crate::core::AgentError;
use crate::llm::{AgentRole, CallOptions, LlmClient};
use crate::memory::Message;

/// 校验严格度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    Lenient,
    #[default]
    Standard,
    /// 另外要求模型给出页面上的证据
    Strict,
}

impl ValidationPolicy {
    /// 判定成功所需的最低置信度
    pub fn min_confidence(self) -> f32 {
        match self {
            ValidationPolicy::Lenient => 0.0,
            ValidationPolicy::Standard => 0.5,
            ValidationPolicy::Strict => 0.8,
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            ValidationPolicy::Lenient => {
                "Accept the result if the task was reasonably attempted and nothing contradicts it."
            }
            ValidationPolicy::Standard => {
                "Accept the result only if the final page or the previous actions show the task was done."
            }
            ValidationPolicy::Strict => {
                "Accept the result only with concrete evidence on the final page. Quote that evidence in \"reason\". Without evidence, reject."
            }
        }
    }

    pub fn accepts(self, verdict: &Verdict) -> bool {
        verdict.is_valid && verdict.confidence >= self.min_confidence()
    }
}

const SYSTEM_PROMPT: &str = r#"You are the validator of a browser automation agent.
Decide whether the original task has been accomplished, based on the final page and the actions taken.
Reply with a single JSON object:
{"is_valid": true, "confidence": 0.0-1.0, "reason": "...", "answer": "final answer for the user"}
"#;

/// Validator 输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_valid: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default, deserialize_with = "lenient_string")]
    pub reason: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub answer: String,
}

fn default_confidence() -> f32 {
    0.5
}

impl Verdict {
    /// 模型不可用时：沿用最后一步动作的结果，置信度取中值
    pub fn fallback(ctx: &StepContext<'_>, reason: &str) -> Self {
        let last = ctx.history.last();
        Self {
            is_valid: last.map(|r| r.success && r.result.is_done).unwrap_or(false),
            confidence: 0.5,
            reason: format!("Validator unavailable: {}", reason),
            answer: last
                .and_then(|r| r.result.extracted_content.clone())
                .unwrap_or_default(),
        }
    }

    /// 给用户的说明：有答案用答案，否则用理由
    pub fn explanation(&self) -> String {
        match (self.answer.trim().is_empty(), self.reason.trim().is_empty()) {
            (false, true) => self.answer.clone(),
            (false, false) => format!("{} ({})", self.answer, self.reason),
            (true, _) => self.reason.clone(),
        }
    }
}

pub struct Validator {
    llm: Arc<dyn LlmClient>,
    policy: ValidationPolicy,
    options: CallOptions,
}

impl Validator {
    pub fn new(llm: Arc<dyn LlmClient>, policy: ValidationPolicy) -> Self {
        Self {
            llm,
            policy,
            options: CallOptions::default().with_temperature(0.0),
        }
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// ctx.state 应为完成信号之后重新捕获的页面；除取消外不返回错误
    pub async fn validate(&self, ctx: &StepContext<'_>, cancel: &CancellationToken) -> Result<Verdict, AgentError> {
        let system = format!("{}{}", SYSTEM_PROMPT, self.policy.instructions());
        let messages = vec![Message::system(system), Message::user(ctx.render())];
        let call = call_agent_llm(
            self.llm.as_ref(),
            &messages,
            &self.options,
            AgentRole::Validator,
            cancel,
        )
        .await;
        match call {
            Ok(raw) => {
                let mut verdict = decode_or(&raw, |e| Verdict::fallback(ctx, &e.to_string()));
                verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
                Ok(verdict)
            }
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(step = ctx.step, error = %e, "validator failed, using fallback verdict");
                Ok(Verdict::fallback(ctx, &e.to_string()))
            }
        }
    }
}
