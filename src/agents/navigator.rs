//! Navigator：把计划翻译成一个具体动作（名称 + 参数）
//!
//! 模型失败时的确定性决策：任务或计划里出现 URL 且当前不在该域名时 navigate，否则 wait。
//! 决策执行前由 `validate_decision` 对照动作目录与当前元素序号检查，不合法时换成 wait。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::decode::{decode_or, lenient_string};
use super::planner::Plan;
use super::{call_agent_llm, StepContext};
use crate::browser::{extract_domain, ActionRegistry, PageState, WAIT_ACTION};
use crate::core::AgentError;
use crate::llm::{AgentRole, CallOptions, LlmClient};
use crate::memory::Message;

const NAVIGATE_ACTION: &str = "navigate";

const SYSTEM_PROMPT: &str = r#"You are the navigator of a browser automation agent.
Given the plan and the current page, choose exactly ONE action from the catalog below.
Refer to page elements only by their [index]. When the task is complete use "done".
Reply with a single JSON object:
{"action": "<name>", "params": {...}, "intent": "why this action"}

Available actions:
"#;

/// Navigator 的决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDecision")]
pub struct NavigatorDecision {
    pub action: String,
    pub params: Value,
    pub intent: String,
}

/// 模型原始输出；action 既可以是名称，也可以是 {"name": {params}}
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(default)]
    action: Value,
    #[serde(default)]
    params: Value,
    #[serde(default, deserialize_with = "lenient_string")]
    intent: String,
}

impl TryFrom<RawDecision> for NavigatorDecision {
    type Error = AgentError;

    fn try_from(raw: RawDecision) -> Result<Self, Self::Error> {
        let (action, params) = match raw.action {
            Value::String(name) => (name, raw.params),
            Value::Object(map) if map.len() == 1 => {
                let (name, params) = map.into_iter().next().ok_or_else(|| {
                    AgentError::JsonParseError("empty action object".to_string())
                })?;
                (name, params)
            }
            other => {
                return Err(AgentError::JsonParseError(format!(
                    "unrecognised action field: {}",
                    other
                )))
            }
        };
        let action = action.trim().to_string();
        if action.is_empty() {
            return Err(AgentError::JsonParseError("empty action name".to_string()));
        }
        Ok(Self {
            action,
            params: if params.is_null() { json!({}) } else { params },
            intent: raw.intent,
        })
    }
}

impl NavigatorDecision {
    pub fn wait(duration_ms: u64, intent: impl Into<String>) -> Self {
        Self {
            action: WAIT_ACTION.to_string(),
            params: json!({ "duration_ms": duration_ms }),
            intent: intent.into(),
        }
    }

    /// params 中的元素序号；存在但不是非负整数时返回 Err
    fn element_index(&self) -> Result<Option<usize>, String> {
        match self.params.get("index") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|i| Some(i as usize))
                .ok_or_else(|| format!("invalid index {}", n)),
            Some(Value::String(s)) => s
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| format!("invalid index {:?}", s)),
            Some(other) => Err(format!("invalid index {}", other)),
        }
    }
}

const KNOWN_TLDS: &[&str] = &[
    "com", "org", "net", "edu", "gov", "io", "dev", "app", "ai", "co", "info", "biz", "xyz",
    "site", "tech", "cn", "uk", "de", "fr", "jp", "kr", "ru", "br", "in", "us", "ca", "au", "nl",
    "eu", "es", "it", "ch", "se", "tv", "me", "cc", "rs",
];

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            // 裸域名须是 www. 开头或常见顶级域，避免把 Node.js、readme.md 当成网址
            let label = r"[a-z0-9](?:[a-z0-9-]*[a-z0-9])?";
            let pattern = format!(
                r"(?i)\b(?:https?://[^\s<>]+|www\.(?:{label}\.)+[a-z]{{2,}}\b(?:/[^\s<>]*)?|(?:{label}\.)+(?:{tlds})\b(?::\d+)?(?:/[^\s<>]*)?)",
                label = label,
                tlds = KNOWN_TLDS.join("|"),
            );
            Regex::new(&pattern).ok()
        })
        .as_ref()
}

/// 文本中的第一个 URL 或域名（去掉结尾标点）
pub fn find_url(text: &str) -> Option<String> {
    let m = url_pattern()?.find(text)?;
    let url = m
        .as_str()
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | '"' | '\''));
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// 模型不可用时的确定性决策
pub fn fallback_decision(
    task: &str,
    plan: &Plan,
    state: &PageState,
    registry: &ActionRegistry,
    wait_ms: u64,
) -> NavigatorDecision {
    if registry.contains(NAVIGATE_ACTION) {
        let target = find_url(&plan.next_steps).or_else(|| find_url(task));
        if let Some(url) = target {
            let target_domain = extract_domain(&url);
            if state.domain.is_empty() || state.domain != target_domain {
                return NavigatorDecision {
                    action: NAVIGATE_ACTION.to_string(),
                    params: json!({ "url": url }),
                    intent: format!("open {}", url),
                };
            }
        }
    }
    NavigatorDecision::wait(wait_ms, "fallback: wait for the page")
}

/// 对照动作目录与当前元素检查决策；不合法时返回 wait 与原因
pub fn validate_decision(
    decision: NavigatorDecision,
    state: &PageState,
    registry: &ActionRegistry,
    wait_ms: u64,
) -> (NavigatorDecision, Option<String>) {
    if !registry.contains(&decision.action) {
        let reason = format!("unknown action '{}'", decision.action);
        return (NavigatorDecision::wait(wait_ms, reason.clone()), Some(reason));
    }
    match decision.element_index() {
        Ok(Some(index)) if !state.has_index(index) => {
            let reason = format!("element index {} not on the current page", index);
            (NavigatorDecision::wait(wait_ms, reason.clone()), Some(reason))
        }
        Err(reason) => (NavigatorDecision::wait(wait_ms, reason.clone()), Some(reason)),
        _ => (decision, None),
    }
}

pub struct Navigator {
    llm: Arc<dyn LlmClient>,
    options: CallOptions,
}

impl Navigator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            options: CallOptions::default().with_temperature(0.0),
        }
    }

    /// 除取消外不返回错误；模型失败或输出不可用时使用 fallback_decision
    pub async fn decide(
        &self,
        ctx: &StepContext<'_>,
        plan: &Plan,
        registry: &ActionRegistry,
        fallback_wait_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<NavigatorDecision, AgentError> {
        let fallback = || fallback_decision(ctx.task, plan, ctx.state, registry, fallback_wait_ms);
        let system = format!("{}{}", SYSTEM_PROMPT, registry.catalog_json());
        let user = format!(
            "{}\n\nPlan:\n- observation: {}\n- next steps: {}\n- challenges: {}",
            ctx.render(),
            plan.observation,
            plan.next_steps,
            plan.challenges
        );
        let messages = vec![Message::system(system), Message::user(user)];
        let call = call_agent_llm(
            self.llm.as_ref(),
            &messages,
            &self.options,
            AgentRole::Navigator,
            cancel,
        )
        .await;
        match call {
            Ok(raw) => Ok(decode_or(&raw, |_| fallback())),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(step = ctx.step, error = %e, "navigator failed, using fallback decision");
                Ok(fallback())
            }
        }
    }
}
