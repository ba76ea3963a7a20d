//! 执行循环的数据模型：步骤记录、任务结果、各 Agent 共享的步骤上下文

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::{ActionResult, PageState};
use crate::memory::MemoryContext;

/// 单步执行记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step: usize,
    pub plan_summary: String,
    pub action: String,
    pub params: Value,
    pub intent: String,
    pub result: ActionResult,
    pub success: bool,
}

impl ExecutionRecord {
    /// prompt 中的一行
    pub fn to_line(&self) -> String {
        format!(
            "step {}: {} {} ({}) -> {}",
            self.step,
            self.action,
            self.params,
            self.intent,
            self.result.summary()
        )
    }
}

/// 任务终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Planner 判定完成，或校验通过
    Success,
    /// 校验未通过
    Failure,
    /// 步数耗尽仍无完成信号
    Exhausted,
    TimedOut,
    Cancelled,
    /// 循环体本身异常
    Error,
}

/// 任务最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,
    pub success: bool,
    /// 只有经过 Validator 的结果才有置信度
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub message: String,
    pub steps: usize,
    #[serde(default)]
    pub records: Vec<ExecutionRecord>,
}

impl TaskResult {
    fn new(outcome: TaskOutcome, message: impl Into<String>, steps: usize, records: Vec<ExecutionRecord>) -> Self {
        Self {
            outcome,
            success: outcome == TaskOutcome::Success,
            confidence: None,
            message: message.into(),
            steps,
            records,
        }
    }

    pub fn planner_done(observation: impl Into<String>, steps: usize, records: Vec<ExecutionRecord>) -> Self {
        Self::new(TaskOutcome::Success, observation, steps, records)
    }

    pub fn validated(
        success: bool,
        confidence: f32,
        message: impl Into<String>,
        steps: usize,
        records: Vec<ExecutionRecord>,
    ) -> Self {
        let outcome = if success {
            TaskOutcome::Success
        } else {
            TaskOutcome::Failure
        };
        Self {
            confidence: Some(confidence),
            ..Self::new(outcome, message, steps, records)
        }
    }

    pub fn exhausted(max_steps: usize, records: Vec<ExecutionRecord>) -> Self {
        Self::new(
            TaskOutcome::Exhausted,
            format!("Reached maximum of {} steps without completing the task", max_steps),
            max_steps,
            records,
        )
    }

    pub fn timed_out(secs: u64, steps: usize, records: Vec<ExecutionRecord>) -> Self {
        Self::new(
            TaskOutcome::TimedOut,
            format!("Task timed out after {} seconds", secs),
            steps,
            records,
        )
    }

    pub fn cancelled(steps: usize, records: Vec<ExecutionRecord>) -> Self {
        Self::new(TaskOutcome::Cancelled, "Task cancelled", steps, records)
    }

    pub fn error(message: impl Into<String>, steps: usize) -> Self {
        Self::new(TaskOutcome::Error, message, steps, Vec::new())
    }
}

/// 一步中各 Agent 读取的上下文（只读借用）
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub task: &'a str,
    pub step: usize,
    pub max_steps: usize,
    pub state: &'a PageState,
    pub history: &'a [ExecutionRecord],
    pub memory: &'a MemoryContext,
    /// 状态里最多展示的元素数
    pub max_elements: usize,
}

/// prompt 中展示的最近记录条数
const HISTORY_IN_PROMPT: usize = 5;

impl StepContext<'_> {
    /// 最近几条执行记录
    pub fn history_section(&self) -> String {
        if self.history.is_empty() {
            return "Previous actions: none".to_string();
        }
        let skip = self.history.len().saturating_sub(HISTORY_IN_PROMPT);
        let lines: Vec<String> = self.history.iter().skip(skip).map(|r| r.to_line()).collect();
        format!("Previous actions:\n{}", lines.join("\n"))
    }

    /// 三个 Agent 共用的 user 消息主体
    pub fn render(&self) -> String {
        format!(
            "Task: {}\nStep: {}/{}\n\n{}\n\n{}\n\n{}",
            self.task,
            self.step,
            self.max_steps,
            self.state.to_prompt_section(self.max_elements),
            self.memory.to_prompt_section(),
            self.history_section()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_flags() {
        assert!(TaskResult::planner_done("ok", 1, Vec::new()).success);
        assert!(!TaskResult::exhausted(15, Vec::new()).success);
        let failed = TaskResult::validated(false, 0.9, "wrong page", 3, Vec::new());
        assert_eq!(failed.outcome, TaskOutcome::Failure);
        assert_eq!(failed.confidence, Some(0.9));
    }

    #[test]
    fn test_result_serializes_outcome_snake_case() {
        let json = serde_json::to_value(TaskResult::timed_out(300, 4, Vec::new())).unwrap();
        assert_eq!(json["outcome"], "timed_out");
        assert_eq!(json["success"], false);
        assert!(json.get("confidence").is_none());
    }
}
