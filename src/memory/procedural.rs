//! 程序记忆：执行循环的有界上下文
//!
//! 原始窗口最多 10 条；溢出时把最旧的 4 条压缩成一条 ProceduralSummary 写入容量为 3 的摘要环，
//! 原始窗口只保留最近 6 条。压缩是批量的，不做逐条滚动。Agent 只能通过 `context()` 读取。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Role;

/// 原始窗口容量
pub const RAW_WINDOW_CAPACITY: usize = 10;
/// 单次压缩的条目数
pub const COMPRESS_BATCH: usize = 4;
/// 压缩后原始窗口保留条数
pub const RAW_KEEP_AFTER_COMPRESS: usize = 6;
/// 摘要环容量
pub const SUMMARY_CAPACITY: usize = 3;
/// `context()` 返回的最近原始条目数
pub const CONTEXT_RECENT: usize = 3;

/// 单条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// 写入时分配的步号（单调递增，从 1 开始）
    pub step: u64,
    pub role: Role,
    /// 产生该条目的动作或阶段（plan / navigate / act / validate ...）
    pub action: String,
    pub content: String,
    /// 毫秒时间戳
    pub timestamp: i64,
}

/// 若干条被淘汰原始条目的压缩替身
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralSummary {
    /// 覆盖的步号区间（闭区间）
    pub step_range: (u64, u64),
    /// 各条目 action 以 " -> " 拼接
    pub actions: String,
    /// 各条目 content 以 "; " 拼接
    pub findings: String,
    pub timestamp: i64,
}

/// `context()` 的只读快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryContext {
    pub recent: Vec<MemoryEntry>,
    pub summaries: Vec<ProceduralSummary>,
    pub current_step: u64,
}

impl MemoryContext {
    /// 拼入 Agent prompt 的片段
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if !self.summaries.is_empty() {
            s.push_str("## Earlier progress\n");
            for sum in &self.summaries {
                s.push_str(&format!(
                    "- steps {}-{}: {} | {}\n",
                    sum.step_range.0, sum.step_range.1, sum.actions, sum.findings
                ));
            }
            s.push('\n');
        }
        if !self.recent.is_empty() {
            s.push_str("## Recent steps\n");
            for e in &self.recent {
                s.push_str(&format!("- [{}] {} ({}): {}\n", e.step, e.action, e.role, e.content));
            }
            s.push('\n');
        }
        s
    }
}

/// 程序记忆：由一个执行循环独占，循环结束即销毁
#[derive(Debug, Default)]
pub struct ProceduralMemory {
    raw: VecDeque<MemoryEntry>,
    summaries: VecDeque<ProceduralSummary>,
    step: u64,
}

/// 非字符串内容按 JSON 文本确定性序列化；字符串原样保存
pub fn stringify_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ProceduralMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记忆，返回分配到的步号
    pub fn add_message(&mut self, role: Role, action: impl Into<String>, content: impl Into<Value>) -> u64 {
        self.step += 1;
        let content = stringify_content(&content.into());
        self.raw.push_back(MemoryEntry {
            step: self.step,
            role,
            action: action.into(),
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        if self.raw.len() > RAW_WINDOW_CAPACITY {
            self.compress();
        }
        self.step
    }

    /// 最旧 4 条 -> 一条摘要；原始窗口截到最近 6 条
    fn compress(&mut self) {
        let batch: Vec<MemoryEntry> = self.raw.drain(..COMPRESS_BATCH).collect();
        let (first, last) = match (batch.first(), batch.last()) {
            (Some(f), Some(l)) => (f.step, l.step),
            _ => return,
        };
        let summary = ProceduralSummary {
            step_range: (first, last),
            actions: batch
                .iter()
                .map(|e| e.action.as_str())
                .collect::<Vec<_>>()
                .join(" -> "),
            findings: batch
                .iter()
                .map(|e| e.content.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        if self.summaries.len() >= SUMMARY_CAPACITY {
            self.summaries.pop_front();
        }
        self.summaries.push_back(summary);

        while self.raw.len() > RAW_KEEP_AFTER_COMPRESS {
            self.raw.pop_front();
        }
        tracing::debug!(from = first, to = last, "compressed procedural memory");
    }

    /// 唯一读取面：最近 3 条原始条目 + 全部摘要 + 当前步号
    pub fn context(&self) -> MemoryContext {
        let skip = self.raw.len().saturating_sub(CONTEXT_RECENT);
        MemoryContext {
            recent: self.raw.iter().skip(skip).cloned().collect(),
            summaries: self.summaries.iter().cloned().collect(),
            current_step: self.step,
        }
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.summaries.clear();
        self.step = 0;
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn summary_len(&self) -> usize {
        self.summaries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fill(mem: &mut ProceduralMemory, n: usize) {
        for i in 0..n {
            mem.add_message(Role::Assistant, format!("act{}", i + 1), format!("found {}", i + 1));
        }
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut mem = ProceduralMemory::new();
        for _ in 0..57 {
            mem.add_message(Role::User, "step", "x");
            assert!(mem.raw_len() <= RAW_WINDOW_CAPACITY);
        }
    }

    #[test]
    fn test_overflow_compresses_oldest_four() {
        let mut mem = ProceduralMemory::new();
        fill(&mut mem, 10);
        assert_eq!(mem.raw_len(), 10);
        assert_eq!(mem.summary_len(), 0);

        fill(&mut mem, 1);
        assert_eq!(mem.raw_len(), 6);
        assert_eq!(mem.summary_len(), 1);

        let ctx = mem.context();
        let summary = &ctx.summaries[0];
        assert_eq!(summary.step_range, (1, 4));
        assert_eq!(summary.actions, "act1 -> act2 -> act3 -> act4");
        assert_eq!(summary.findings, "found 1; found 2; found 3; found 4");
        // 剩余窗口是最近 6 步：6..=11
        assert_eq!(ctx.recent.iter().map(|e| e.step).collect::<Vec<_>>(), vec![9, 10, 11]);
    }

    #[test]
    fn test_each_overflow_appends_exactly_one_summary() {
        let mut mem = ProceduralMemory::new();
        fill(&mut mem, 11);
        assert_eq!(mem.summary_len(), 1);
        // 6 + 4 = 10，不溢出
        fill(&mut mem, 4);
        assert_eq!(mem.summary_len(), 1);
        fill(&mut mem, 1);
        assert_eq!(mem.summary_len(), 2);
        assert_eq!(mem.raw_len(), 6);
    }

    #[test]
    fn test_summary_ring_evicts_oldest() {
        let mut mem = ProceduralMemory::new();
        // 11 + 5 * 3 = 26 次写入 -> 4 次溢出
        fill(&mut mem, 26);
        let ctx = mem.context();
        assert_eq!(ctx.summaries.len(), SUMMARY_CAPACITY);
        assert_eq!(ctx.summaries[0].step_range, (6, 9));
        assert_eq!(ctx.current_step, 26);
    }

    #[test]
    fn test_context_shape() {
        let mut mem = ProceduralMemory::new();
        fill(&mut mem, 2);
        let ctx = mem.context();
        assert_eq!(ctx.recent.len(), 2);
        assert!(ctx.summaries.is_empty());
        assert_eq!(ctx.current_step, 2);
    }

    #[test]
    fn test_non_string_content_is_stringified() {
        let mut mem = ProceduralMemory::new();
        mem.add_message(Role::Assistant, "act", json!({"success": true, "index": 3}));
        mem.add_message(Role::Assistant, "act", json!(42));
        let ctx = mem.context();
        assert_eq!(ctx.recent[0].content, r#"{"index":3,"success":true}"#);
        assert_eq!(ctx.recent[1].content, "42");
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut mem = ProceduralMemory::new();
        fill(&mut mem, 15);
        mem.clear();
        let ctx = mem.context();
        assert_eq!(ctx, MemoryContext::default());
        assert_eq!(mem.add_message(Role::User, "task", "again"), 1);
    }
}
