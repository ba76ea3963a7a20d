//! 多 Agent 执行循环
//!
//! 每步：捕获页面 -> Planner（done 则直接成功）-> Navigator -> 校验动作 -> 执行并记录
//! -> 若动作给出完成信号则重新捕获页面并交给 Validator 定论，否则间隔后进入下一步。
//! 取消与超时在每步开头检查；取消还会在动作前后与步间等待时检查，观察到后立即退出且不做校验。
//! 单个 Agent 失败由其兜底决策吸收；只有循环本身的错误（如动作表缺少 wait）才以 task_error 结束。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::navigator::validate_decision;
use super::{ExecutionRecord, Navigator, Planner, StepContext, TaskResult, ValidationPolicy, Validator};
use crate::browser::{ActionContext, ActionRegistry, PageState, StateProvider, WAIT_ACTION};
use crate::config::AppConfig;
use crate::core::{AgentError, TaskCallback, TaskExecutor};
use crate::gateway::MessageType;
use crate::llm::LlmClient;
use crate::memory::{MemoryContext, ProceduralMemory, Role};

/// 执行循环参数（来自 [agent] 段）
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_steps: usize,
    pub step_delay: Duration,
    pub task_timeout: Duration,
    /// 非法动作被替换为 wait 时的等待时长
    pub fallback_wait_ms: u64,
    pub validation_policy: ValidationPolicy,
    /// prompt 中最多列出的元素数
    pub max_elements: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 15,
            step_delay: Duration::from_millis(1000),
            task_timeout: Duration::from_secs(300),
            fallback_wait_ms: 1000,
            validation_policy: ValidationPolicy::Standard,
            max_elements: 200,
        }
    }
}

impl LoopConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_steps: cfg.agent.max_steps.max(1),
            step_delay: Duration::from_millis(cfg.agent.step_delay_ms),
            task_timeout: Duration::from_secs(cfg.agent.task_timeout_secs),
            fallback_wait_ms: cfg.agent.fallback_wait_ms,
            validation_policy: cfg.agent.validation_policy,
            max_elements: cfg.browser.max_elements,
        }
    }
}

/// 一次任务的执行器；Planner / Navigator / Validator 共用同一个（带重试的）模型客户端
pub struct ExecutionLoop {
    planner: Planner,
    navigator: Navigator,
    validator: Validator,
    registry: ActionRegistry,
    state: Arc<dyn StateProvider>,
    config: LoopConfig,
}

impl ExecutionLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: ActionRegistry,
        state: Arc<dyn StateProvider>,
        config: LoopConfig,
    ) -> Self {
        Self {
            planner: Planner::new(Arc::clone(&llm)),
            navigator: Navigator::new(Arc::clone(&llm)),
            validator: Validator::new(llm, config.validation_policy),
            registry,
            state,
            config,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    fn status(&self, callback: &dyn TaskCallback, message: impl Into<String>) {
        callback.send(MessageType::StatusUpdate {
            message: message.into(),
        });
    }

    fn step_context<'a>(
        &self,
        task: &'a str,
        step: usize,
        state: &'a PageState,
        history: &'a [ExecutionRecord],
        memory: &'a MemoryContext,
    ) -> StepContext<'a> {
        StepContext {
            task,
            step,
            max_steps: self.config.max_steps,
            state,
            history,
            memory,
            max_elements: self.config.max_elements,
        }
    }

    /// 执行一个任务并通过 callback 报告进度与终态；取消时不发终态消息（由任务管理器宣布）
    pub async fn run(
        &self,
        task_id: &str,
        task: &str,
        callback: &dyn TaskCallback,
        cancel: &CancellationToken,
    ) -> TaskResult {
        match self.run_steps(task_id, task, callback, cancel).await {
            Ok(result) => {
                if result.outcome != super::TaskOutcome::Cancelled {
                    tracing::info!(
                        task_id,
                        outcome = ?result.outcome,
                        steps = result.steps,
                        success = result.success,
                        "task finished"
                    );
                    callback.send(MessageType::TaskComplete {
                        result: result.clone(),
                    });
                } else {
                    tracing::info!(task_id, steps = result.steps, "task loop observed cancellation");
                }
                result
            }
            Err(e) => {
                tracing::error!(task_id, error = %e, "task loop aborted");
                callback.send(MessageType::TaskError {
                    error: e.to_string(),
                });
                TaskResult::error(e.to_string(), 0)
            }
        }
    }

    async fn run_steps(
        &self,
        task_id: &str,
        task: &str,
        callback: &dyn TaskCallback,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, AgentError> {
        if !self.registry.contains(WAIT_ACTION) {
            return Err(AgentError::ConfigError(format!(
                "action registry does not publish '{}'",
                WAIT_ACTION
            )));
        }

        let max_steps = self.config.max_steps;
        let started = Instant::now();
        let mut memory = ProceduralMemory::new();
        let mut records: Vec<ExecutionRecord> = Vec::new();
        memory.add_message(Role::User, "task", task);

        for step in 1..=max_steps {
            if cancel.is_cancelled() {
                return Ok(TaskResult::cancelled(step - 1, records));
            }
            if started.elapsed() >= self.config.task_timeout {
                tracing::warn!(task_id, step, "task timed out");
                return Ok(TaskResult::timed_out(
                    self.config.task_timeout.as_secs(),
                    step - 1,
                    records,
                ));
            }

            self.status(callback, format!("Step {}/{}: reading page", step, max_steps));
            let state = self.state.current_state(cancel).await;
            let memory_ctx = memory.context();
            let ctx = self.step_context(task, step, &state, &records, &memory_ctx);

            self.status(callback, format!("Step {}/{}: planning", step, max_steps));
            let plan = match self.planner.plan(&ctx, cancel).await {
                Ok(plan) => plan,
                Err(AgentError::Cancelled) => return Ok(TaskResult::cancelled(step - 1, records)),
                Err(e) => return Err(e),
            };
            tracing::debug!(task_id, step, done = plan.done, next = %plan.next_steps, "plan");
            if plan.done {
                self.status(callback, format!("Step {}/{}: planner reports the task is done", step, max_steps));
                return Ok(TaskResult::planner_done(plan.observation, step, records));
            }

            self.status(callback, format!("Step {}/{}: choosing action", step, max_steps));
            let decision = match self
                .navigator
                .decide(&ctx, &plan, &self.registry, self.config.fallback_wait_ms, cancel)
                .await
            {
                Ok(decision) => decision,
                Err(AgentError::Cancelled) => return Ok(TaskResult::cancelled(step - 1, records)),
                Err(e) => return Err(e),
            };
            memory.add_message(Role::Assistant, "plan", plan.summary());

            let (decision, rejected) =
                validate_decision(decision, &state, &self.registry, self.config.fallback_wait_ms);
            if let Some(reason) = rejected {
                tracing::warn!(task_id, step, %reason, "navigator action rejected, waiting instead");
                self.status(callback, format!("Step {}/{}: {}, waiting instead", step, max_steps, reason));
            }

            if cancel.is_cancelled() {
                return Ok(TaskResult::cancelled(step - 1, records));
            }
            self.status(
                callback,
                format!("Step {}/{}: {} ({})", step, max_steps, decision.action, decision.intent),
            );
            let action_ctx = ActionContext::new(task_id, cancel.clone());
            let result = self
                .registry
                .execute(&decision.action, decision.params.clone(), &action_ctx)
                .await;
            memory.add_message(Role::Assistant, decision.action.clone(), result.summary());
            let is_done = result.is_done;
            records.push(ExecutionRecord {
                step,
                plan_summary: plan.summary(),
                action: decision.action,
                params: decision.params,
                intent: decision.intent,
                success: result.success,
                result,
            });

            if cancel.is_cancelled() {
                return Ok(TaskResult::cancelled(step, records));
            }

            if is_done {
                self.status(callback, format!("Step {}/{}: validating result", step, max_steps));
                let final_state = self.state.current_state(cancel).await;
                let memory_ctx = memory.context();
                let ctx = self.step_context(task, step, &final_state, &records, &memory_ctx);
                let verdict = match self.validator.validate(&ctx, cancel).await {
                    Ok(verdict) => verdict,
                    Err(AgentError::Cancelled) => return Ok(TaskResult::cancelled(step, records)),
                    Err(e) => return Err(e),
                };
                let success = self.validator.policy().accepts(&verdict);
                tracing::info!(
                    task_id,
                    step,
                    is_valid = verdict.is_valid,
                    confidence = verdict.confidence,
                    success,
                    "validation finished"
                );
                return Ok(TaskResult::validated(
                    success,
                    verdict.confidence,
                    verdict.explanation(),
                    step,
                    records,
                ));
            }

            if step < max_steps {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(TaskResult::cancelled(step, records)),
                    _ = tokio::time::sleep(self.config.step_delay) => {}
                }
            }
        }

        tracing::warn!(task_id, max_steps, "step budget exhausted");
        Ok(TaskResult::exhausted(max_steps, records))
    }
}

#[async_trait]
impl TaskExecutor for ExecutionLoop {
    async fn execute(
        &self,
        task_id: String,
        input: String,
        callback: Arc<dyn TaskCallback>,
        cancel: CancellationToken,
    ) {
        self.run(&task_id, &input, callback.as_ref(), &cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::TaskOutcome;
    use crate::browser::{ActionResult, BrowserAction, EmptyStateProvider};
    use crate::llm::{AgentRole, LlmError, Provider, RetryConfig, RetryingLlmClient, ScriptedLlmClient};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MessageType>>);

    impl TaskCallback for Recorder {
        fn send(&self, message: MessageType) {
            self.0.lock().unwrap().push(message);
        }
    }

    impl Recorder {
        fn terminal_count(&self) -> usize {
            self.0.lock().unwrap().iter().filter(|m| m.is_terminal()).count()
        }
    }

    struct FakeNavigate;

    #[async_trait]
    impl BrowserAction for FakeNavigate {
        fn name(&self) -> &str {
            "navigate"
        }

        fn description(&self) -> &str {
            "Open a URL"
        }

        async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
            ActionResult::ok(format!("Navigated to {}", params["url"].as_str().unwrap_or("")))
        }
    }

    /// 完成动作执行期间取消任务
    struct CancellingDone;

    #[async_trait]
    impl BrowserAction for CancellingDone {
        fn name(&self) -> &str {
            "done"
        }

        fn description(&self) -> &str {
            "done"
        }

        async fn execute(&self, _params: Value, ctx: &ActionContext) -> ActionResult {
            ctx.cancel.cancel();
            ActionResult::done("finished")
        }
    }

    fn config(max_steps: usize) -> LoopConfig {
        LoopConfig {
            max_steps,
            step_delay: Duration::from_millis(1000),
            task_timeout: Duration::from_secs(300),
            fallback_wait_ms: 0,
            validation_policy: ValidationPolicy::Standard,
            max_elements: 50,
        }
    }

    fn registry() -> ActionRegistry {
        let mut r = ActionRegistry::with_builtins();
        r.register(FakeNavigate);
        r
    }

    fn build(llm: Arc<ScriptedLlmClient>, registry: ActionRegistry, cfg: LoopConfig) -> ExecutionLoop {
        ExecutionLoop::new(llm, registry, Arc::new(EmptyStateProvider), cfg)
    }

    #[tokio::test(start_paused = true)]
    async fn test_planner_done_on_first_step() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_role_ok(AgentRole::Planner, r#"{"observation": "already on the page", "done": true}"#);
        let exec = build(llm.clone(), registry(), config(15));
        let rec = Recorder::default();

        let result = exec.run("t1", "open the docs", &rec, &CancellationToken::new()).await;
        assert_eq!(result.outcome, TaskOutcome::Success);
        assert!(result.success);
        assert!(result.records.is_empty());
        assert_eq!(result.message, "already on the page");
        assert_eq!(llm.role_call_count(AgentRole::Navigator), 0);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallbacks_navigate_to_mentioned_domain() {
        // 模型全部失败：Planner 兜底 done=false，Navigator 兜底 navigate
        let llm = Arc::new(ScriptedLlmClient::new());
        let exec = build(llm, registry(), config(1));
        let rec = Recorder::default();

        let result = exec
            .run("t1", "navigate to example.com", &rec, &CancellationToken::new())
            .await;
        assert_eq!(result.records.len(), 1);
        let record = &result.records[0];
        assert_eq!(record.action, "navigate");
        assert_eq!(record.params["url"], "example.com");
        assert!(record.success);
        assert_eq!(result.outcome, TaskOutcome::Exhausted);
        assert!(!result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_stays_within_step_budget() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let exec = build(llm.clone(), registry(), config(3));
        let rec = Recorder::default();

        let result = exec.run("t1", "click around", &rec, &CancellationToken::new()).await;
        assert_eq!(result.outcome, TaskOutcome::Exhausted);
        assert_eq!(result.steps, 3);
        assert_eq!(result.records.len(), 3);
        assert!(result.records.iter().all(|r| r.action == "wait"));
        assert_eq!(llm.role_call_count(AgentRole::Planner), 3);
        assert_eq!(llm.role_call_count(AgentRole::Validator), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_action_substituted_with_wait() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_role_ok(AgentRole::Planner, r#"{"done": false, "next_steps": "fly"}"#);
        llm.push_role_ok(AgentRole::Navigator, r#"{"action": "teleport", "params": {}, "intent": "fly"}"#);
        let exec = build(llm, registry(), config(1));
        let rec = Recorder::default();

        let result = exec.run("t1", "fly away", &rec, &CancellationToken::new()).await;
        assert_eq!(result.records[0].action, "wait");
        assert!(rec
            .0
            .lock()
            .unwrap()
            .iter()
            .any(|m| matches!(m, MessageType::StatusUpdate { message } if message.contains("teleport"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_action_is_validated() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_role_ok(AgentRole::Planner, r#"{"done": false, "next_steps": "report"}"#);
        llm.push_role_ok(AgentRole::Navigator, r#"{"action": "done", "params": {"text": "3 items"}, "intent": "report"}"#);
        llm.push_role_ok(AgentRole::Validator, r#"{"is_valid": true, "confidence": 0.4, "reason": "weak evidence", "answer": "3 items"}"#);
        let exec = build(llm, registry(), config(5));
        let rec = Recorder::default();

        let result = exec.run("t1", "count items", &rec, &CancellationToken::new()).await;
        // confidence 0.4 低于 standard 门槛
        assert_eq!(result.outcome, TaskOutcome::Failure);
        assert_eq!(result.confidence, Some(0.4));
        assert_eq!(result.records.len(), 1);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_action_skips_validation() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_role_ok(AgentRole::Planner, r#"{"done": false}"#);
        llm.push_role_ok(AgentRole::Navigator, r#"{"action": "done", "params": {}}"#);
        let mut reg = ActionRegistry::with_builtins();
        reg.register(CancellingDone);
        let exec = build(llm.clone(), reg, config(5));
        let rec = Recorder::default();

        let result = exec.run("t1", "anything", &rec, &CancellationToken::new()).await;
        assert_eq!(result.outcome, TaskOutcome::Cancelled);
        assert_eq!(llm.role_call_count(AgentRole::Validator), 0);
        assert_eq!(rec.terminal_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_step_delay() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let exec = Arc::new(build(llm.clone(), registry(), config(10)));
        let cancel = CancellationToken::new();
        let rec = Arc::new(Recorder::default());

        let handle = {
            let (exec, cancel, rec) = (exec.clone(), cancel.clone(), rec.clone());
            tokio::spawn(async move { exec.run("t1", "wait forever", rec.as_ref(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result.outcome, TaskOutcome::Cancelled);
        assert_eq!(result.records.len(), 2);
        assert_eq!(llm.role_call_count(AgentRole::Planner), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_checked_at_step_top() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let mut cfg = config(15);
        cfg.task_timeout = Duration::from_millis(2500);
        let exec = build(llm, registry(), cfg);
        let rec = Recorder::default();

        let result = exec.run("t1", "slow task", &rec, &CancellationToken::new()).await;
        assert_eq!(result.outcome, TaskOutcome::TimedOut);
        assert_eq!(result.steps, 3);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_wait_is_loop_error() {
        let llm = Arc::new(ScriptedLlmClient::new());
        let exec = build(llm, ActionRegistry::new(), config(3));
        let rec = Recorder::default();

        let result = exec.run("t1", "anything", &rec, &CancellationToken::new()).await;
        assert_eq!(result.outcome, TaskOutcome::Error);
        let messages = rec.0.lock().unwrap();
        assert!(matches!(messages.last(), Some(MessageType::TaskError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_errors_fall_back_within_the_phase() {
        // 主 provider：Planner token 超限；其余调用两个 provider 都失败（Other）
        let primary = Arc::new(ScriptedLlmClient::new());
        primary.push_role_err(
            AgentRole::Planner,
            LlmError::TokenLimitExceeded("context length exceeded".into()),
        );
        let backup = Arc::new(ScriptedLlmClient::new());
        let llm = RetryingLlmClient::new(
            vec![
                Provider::new("primary", primary.clone()),
                Provider::new("backup", backup.clone()),
            ],
            RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_millis(100),
            },
        )
        .unwrap();
        let exec = ExecutionLoop::new(Arc::new(llm), registry(), Arc::new(EmptyStateProvider), config(1));
        let rec = Recorder::default();

        let result = exec.run("t1", "summarise the page", &rec, &CancellationToken::new()).await;
        assert_eq!(result.outcome, TaskOutcome::Exhausted);
        assert_ne!(result.outcome, TaskOutcome::Error);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].action, WAIT_ACTION);

        // token 超限既不重试也不切换
        assert_eq!(primary.role_call_count(AgentRole::Planner), 1);
        assert_eq!(backup.role_call_count(AgentRole::Planner), 0);
        // Other 在每个 provider 上各试一次
        assert_eq!(primary.role_call_count(AgentRole::Navigator), 1);
        assert_eq!(backup.role_call_count(AgentRole::Navigator), 1);

        let messages = rec.0.lock().unwrap();
        assert_eq!(messages.iter().filter(|m| m.is_terminal()).count(), 1);
        assert!(matches!(messages.last(), Some(MessageType::TaskComplete { .. })));
    }
}
