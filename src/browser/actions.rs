//! 动作注册表
//!
//! 每个浏览器动作实现 BrowserAction（name / description / input_schema / execute），启动时注册，
//! 执行循环按名称查找。参数 schema 由 schemars 从参数结构体生成，发布给 Navigator。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// wait 动作名（执行循环的安全默认动作）
pub const WAIT_ACTION: &str = "wait";
/// done 动作名（完成信号）
pub const DONE_ACTION: &str = "done";
/// 单次 wait 的上限
pub const MAX_WAIT_MS: u64 = 10_000;

/// 动作执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub extracted_content: Option<String>,
    pub error: Option<String>,
    /// 动作声明任务已完成
    #[serde(default)]
    pub is_done: bool,
}

impl ActionResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            extracted_content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self {
            success: true,
            extracted_content: Some(content.into()),
            error: None,
            is_done: true,
        }
    }

    /// 给记忆与 prompt 用的一行摘要
    pub fn summary(&self) -> String {
        match (&self.error, &self.extracted_content) {
            (Some(e), _) => format!("failed: {}", e),
            (None, Some(c)) => c.clone(),
            (None, None) => if self.success { "ok" } else { "failed" }.to_string(),
        }
    }
}

/// 执行上下文：取消令牌与所属任务
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub task_id: String,
    pub cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(task_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            cancel,
        }
    }
}

/// 发布给 Navigator 的动作目录项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSpec {
    pub description: String,
    pub input_schema: Value,
}

/// 浏览器动作 trait
#[async_trait]
pub trait BrowserAction: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn input_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// 执行失败也以 ActionResult 返回，不 panic、不抛错
    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult;
}

/// 由参数结构体生成 schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| serde_json::json!({}))
}

/// 解析参数；失败时给出可读错误
pub fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, String> {
    let params = if params.is_null() {
        serde_json::json!({})
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| format!("invalid params: {}", e))
}

/// 动作注册表：按名称存储 Arc<dyn BrowserAction>
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn BrowserAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置 wait 与 done 的注册表
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(WaitAction);
        registry.register(DoneAction);
        registry
    }

    pub fn register(&mut self, action: impl BrowserAction + 'static) {
        self.register_arc(Arc::new(action));
    }

    pub fn register_arc(&mut self, action: Arc<dyn BrowserAction>) {
        let name = action.name().to_string();
        self.actions.insert(name, action);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// 发布的动作目录（按名称排序，prompt 稳定）
    pub fn list_actions(&self) -> BTreeMap<String, ActionSpec> {
        self.actions
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    ActionSpec {
                        description: action.description().to_string(),
                        input_schema: action.input_schema(),
                    },
                )
            })
            .collect()
    }

    /// 目录的 JSON 文本，拼入 Navigator prompt
    pub fn catalog_json(&self) -> String {
        serde_json::to_string_pretty(&self.list_actions()).unwrap_or_else(|_| "{}".to_string())
    }

    /// 执行指定动作；未注册的名称返回失败结果
    pub async fn execute(&self, name: &str, params: Value, ctx: &ActionContext) -> ActionResult {
        let Some(action) = self.actions.get(name) else {
            return ActionResult::failed(format!("Unknown action: {}", name));
        };
        let started = std::time::Instant::now();
        let result = action.execute(params, ctx).await;
        tracing::info!(
            task_id = %ctx.task_id,
            action = name,
            success = result.success,
            is_done = result.is_done,
            duration_ms = started.elapsed().as_millis() as u64,
            "action executed"
        );
        result
    }
}

/// wait 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WaitParams {
    /// 等待毫秒数（上限 10000）
    #[serde(default = "default_wait_ms")]
    pub duration_ms: u64,
}

fn default_wait_ms() -> u64 {
    1000
}

/// 有界等待；可被取消提前打断
pub struct WaitAction;

#[async_trait]
impl BrowserAction for WaitAction {
    fn name(&self) -> &str {
        WAIT_ACTION
    }

    fn description(&self) -> &str {
        "Wait for the page to settle. Params: {\"duration_ms\": 1000}"
    }

    fn input_schema(&self) -> Value {
        schema_of::<WaitParams>()
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let params: WaitParams = match parse_params(params) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(e),
        };
        let ms = params.duration_ms.min(MAX_WAIT_MS);
        tokio::select! {
            _ = ctx.cancel.cancelled() => ActionResult::failed("wait cancelled"),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                ActionResult::ok(format!("Waited {} ms", ms))
            }
        }
    }
}

/// done 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DoneParams {
    /// 给用户的最终答复
    #[serde(default)]
    pub text: String,
}

/// 完成信号：触发校验阶段
pub struct DoneAction;

#[async_trait]
impl BrowserAction for DoneAction {
    fn name(&self) -> &str {
        DONE_ACTION
    }

    fn description(&self) -> &str {
        "Finish the task and report the answer. Params: {\"text\": \"final answer\"}"
    }

    fn input_schema(&self) -> Value {
        schema_of::<DoneParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        match parse_params::<DoneParams>(params) {
            Ok(p) => ActionResult::done(p.text),
            Err(e) => ActionResult::failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ActionContext {
        ActionContext::new("t1", CancellationToken::new())
    }

    #[test]
    fn test_catalog_lists_builtins_with_schema() {
        let registry = ActionRegistry::with_builtins();
        let catalog = registry.list_actions();
        assert_eq!(catalog.keys().cloned().collect::<Vec<_>>(), vec!["done", "wait"]);
        let schema = &catalog["wait"].input_schema;
        assert!(schema["properties"]["duration_ms"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let registry = ActionRegistry::with_builtins();
        let result = registry.execute("teleport", Value::Null, &ctx()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("teleport"));
    }

    #[tokio::test]
    async fn test_done_sets_is_done() {
        let registry = ActionRegistry::with_builtins();
        let result = registry
            .execute("done", serde_json::json!({"text": "all set"}), &ctx())
            .await;
        assert!(result.success && result.is_done);
        assert_eq!(result.extracted_content.as_deref(), Some("all set"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded() {
        let registry = ActionRegistry::with_builtins();
        let start = tokio::time::Instant::now();
        let result = registry
            .execute("wait", serde_json::json!({"duration_ms": 600_000}), &ctx())
            .await;
        assert!(result.success);
        assert_eq!(start.elapsed().as_millis(), MAX_WAIT_MS as u128);
    }

    #[tokio::test]
    async fn test_wait_observes_cancel() {
        let registry = ActionRegistry::with_builtins();
        let ctx = ctx();
        ctx.cancel.cancel();
        let result = registry
            .execute("wait", serde_json::json!({"duration_ms": 5000}), &ctx)
            .await;
        assert!(!result.success);
    }

    #[test]
    fn test_summary() {
        assert_eq!(ActionResult::failed("boom").summary(), "failed: boom");
        assert_eq!(ActionResult::ok("clicked").summary(), "clicked");
    }
}
