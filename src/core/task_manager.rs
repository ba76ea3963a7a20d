//! 任务生命周期管理
//!
//! 任务由管理器独占：start 登记为运行中并设为活动任务，延迟一个短 tick 后在后台启动执行器；
//! 执行器的所有进度经 TaskCallback 回到管理器，写入任务消息日志并交给广播器。
//! 终态只从回调流量识别（task_complete / task_error），或由 cancel 直接宣布；进入终态的任务
//! 移入终态表，之后到达的消息照常记录与广播，但不再改变状态。

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::TaskManagerError;
use super::task_scheduler::TaskScheduler;
use crate::agents::TaskResult;
use crate::config::TasksSection;
use crate::gateway::{Broadcaster, GatewayMessage, MessageType};

/// 执行器向管理器报告进度的唯一通道
pub trait TaskCallback: Send + Sync {
    fn send(&self, message: MessageType);
}

/// 任务执行器
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task_id: String,
        input: String,
        callback: Arc<dyn TaskCallback>,
        cancel: CancellationToken,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self != TaskStatus::Running
    }
}

/// 对外的任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub input: String,
    pub status: TaskStatus,
    /// 毫秒时间戳
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub message_count: usize,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug)]
struct Task {
    id: String,
    input: String,
    status: TaskStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    messages: VecDeque<GatewayMessage>,
    result: Option<TaskResult>,
    error: Option<String>,
    cancel: CancellationToken,
}

impl Task {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            input: self.input.clone(),
            status: self.status,
            start_time: self.start_time.timestamp_millis(),
            end_time: self.end_time.map(|t| t.timestamp_millis()),
            message_count: self.messages.len(),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    fn log(&mut self, message: GatewayMessage, limit: usize) {
        if self.messages.len() >= limit {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

/// 管理器参数（来自 [tasks] 段）
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_concurrent: usize,
    pub start_delay: Duration,
    pub message_log_limit: usize,
    pub history_limit: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self::from_section(&TasksSection::default())
    }
}

impl TaskManagerConfig {
    pub fn from_section(section: &TasksSection) -> Self {
        Self {
            max_concurrent: section.max_concurrent,
            start_delay: Duration::from_millis(section.start_delay_ms),
            message_log_limit: section.message_log_limit.max(1),
            history_limit: section.history_limit.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    running: HashMap<String, Task>,
    terminal: HashMap<String, Task>,
    /// 终态表按进入顺序（即 end_time 顺序）
    terminal_order: VecDeque<String>,
}

struct Inner {
    tables: Mutex<Tables>,
    scheduler: TaskScheduler,
    broadcaster: Arc<Broadcaster>,
    config: TaskManagerConfig,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retire(&self, tables: &mut Tables, task: Task) {
        tables.terminal_order.push_back(task.id.clone());
        tables.terminal.insert(task.id.clone(), task);
        while tables.terminal.len() > self.config.history_limit {
            match tables.terminal_order.pop_front() {
                Some(oldest) => {
                    tables.terminal.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// 回调入口：记录、识别终态、广播
    fn record(&self, task_id: &str, message: MessageType) {
        let mut tables = self.tables();
        let terminal = message.is_terminal();
        let gm = GatewayMessage::for_task(task_id, message);
        let limit = self.config.message_log_limit;

        if let Some(mut task) = tables.running.remove(task_id) {
            task.log(gm.clone(), limit);
            if terminal {
                match &gm.message {
                    MessageType::TaskComplete { result } => {
                        task.result = Some(result.clone());
                        task.finish(TaskStatus::Completed);
                    }
                    MessageType::TaskError { error } => {
                        task.error = Some(error.clone());
                        task.finish(TaskStatus::Error);
                    }
                    _ => {}
                }
                tracing::info!(task_id, status = ?task.status, "task reached terminal state");
                self.retire(&mut tables, task);
            } else {
                tables.running.insert(task_id.to_string(), task);
            }
        } else if let Some(task) = tables.terminal.get_mut(task_id) {
            tracing::debug!(task_id, kind = gm.message.type_name(), "late message for finished task");
            task.log(gm.clone(), limit);
            // 已结束的任务只有一个终态信号，迟到的终态消息只记录不广播
            if terminal {
                return;
            }
        } else {
            tracing::warn!(task_id, kind = gm.message.type_name(), "message for unknown task dropped");
            return;
        }

        self.broadcaster.broadcast(gm);
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.tables().running.contains_key(task_id)
    }
}

/// 执行器持有的回调：把消息路由回所属任务
struct ManagerCallback {
    task_id: String,
    inner: Arc<Inner>,
}

impl TaskCallback for ManagerCallback {
    fn send(&self, message: MessageType) {
        self.inner.record(&self.task_id, message);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// 任务生命周期管理器；克隆共享同一份状态
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                scheduler: TaskScheduler::new(config.max_concurrent),
                broadcaster,
                config,
            }),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.inner.broadcaster
    }

    /// 登记任务、设为活动任务、发出 task_start，短延迟后在后台运行执行器
    pub fn start(
        &self,
        task_id: impl Into<String>,
        input: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<TaskSnapshot, TaskManagerError> {
        let task_id = task_id.into();
        let input = input.into();
        if input.trim().is_empty() {
            return Err(TaskManagerError::EmptyInput);
        }

        let cancel = CancellationToken::new();
        let (permit, snapshot) = {
            let mut tables = self.inner.tables();
            if tables.running.contains_key(&task_id) {
                return Err(TaskManagerError::AlreadyRunning(task_id));
            }
            if tables.terminal.contains_key(&task_id) {
                return Err(TaskManagerError::AlreadyFinished(task_id));
            }
            let permit = self.inner.scheduler.try_admit().ok_or_else(|| {
                tracing::warn!(task_id = %task_id, limit = self.inner.scheduler.limit(), "task rejected, at capacity");
                TaskManagerError::CapacityExceeded(self.inner.scheduler.limit())
            })?;
            let task = Task {
                id: task_id.clone(),
                input: input.clone(),
                status: TaskStatus::Running,
                start_time: Utc::now(),
                end_time: None,
                messages: VecDeque::new(),
                result: None,
                error: None,
                cancel: cancel.clone(),
            };
            let snapshot = task.snapshot();
            tables.running.insert(task_id.clone(), task);
            (permit, snapshot)
        };
        self.inner.broadcaster.set_active_task(Some(task_id.clone()));
        tracing::info!(task_id = %task_id, "task started");

        let callback: Arc<dyn TaskCallback> = Arc::new(ManagerCallback {
            task_id: task_id.clone(),
            inner: Arc::clone(&self.inner),
        });
        callback.send(MessageType::TaskStart { task: input.clone() });

        let inner = Arc::clone(&self.inner);
        let delay = self.inner.config.start_delay;
        tokio::spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let run = executor.execute(task_id.clone(), input, Arc::clone(&callback), cancel.clone());
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(()) => {
                    if !cancel.is_cancelled() && inner.is_running(&task_id) {
                        callback.send(MessageType::TaskError {
                            error: "executor finished without a result".to_string(),
                        });
                    }
                }
                Err(payload) => {
                    let error = format!("executor panicked: {}", panic_message(payload.as_ref()));
                    tracing::error!(task_id = %task_id, %error, "task executor panicked");
                    callback.send(MessageType::TaskError { error });
                }
            }
        });

        Ok(snapshot)
    }

    /// 取消运行中的任务；未知或已结束的任务返回 false 且不发消息
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut tables = self.inner.tables();
        let Some(mut task) = tables.running.remove(task_id) else {
            return false;
        };
        task.cancel.cancel();
        task.finish(TaskStatus::Cancelled);
        let gm = GatewayMessage::for_task(task_id, MessageType::TaskCancelled);
        task.log(gm.clone(), self.inner.config.message_log_limit);
        self.inner.retire(&mut tables, task);
        self.inner.broadcaster.broadcast(gm);
        tracing::info!(task_id, "task cancelled");
        true
    }

    /// 取消所有运行中的任务（关闭时使用）
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.inner.tables().running.keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskSnapshot> {
        let tables = self.inner.tables();
        tables
            .running
            .get(task_id)
            .or_else(|| tables.terminal.get(task_id))
            .map(Task::snapshot)
    }

    pub fn active_task(&self) -> Option<String> {
        self.inner.broadcaster.active_task()
    }

    /// 活动任务的快照
    pub fn active_status(&self) -> Option<TaskSnapshot> {
        self.active_task().and_then(|id| self.status(&id))
    }

    /// 任务消息日志的最后 limit 条（旧到新）
    pub fn recent_messages(&self, task_id: &str, limit: usize) -> Vec<GatewayMessage> {
        let tables = self.inner.tables();
        let Some(task) = tables.running.get(task_id).or_else(|| tables.terminal.get(task_id)) else {
            return Vec::new();
        };
        let skip = task.messages.len().saturating_sub(limit);
        task.messages.iter().skip(skip).cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner.tables().running.len()
    }

    /// 两张表的所有任务，按开始时间排序
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let tables = self.inner.tables();
        let mut all: Vec<TaskSnapshot> = tables
            .running
            .values()
            .chain(tables.terminal.values())
            .map(Task::snapshot)
            .collect();
        all.sort_by_key(|t| t.start_time);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::TaskResult;

    fn manager(max_concurrent: usize) -> TaskManager {
        let config = TaskManagerConfig {
            max_concurrent,
            start_delay: Duration::from_millis(100),
            message_log_limit: 100,
            history_limit: 50,
        };
        TaskManager::new(config, Arc::new(Broadcaster::new(50)))
    }

    /// 发一条进度后正常完成
    struct Completing;

    #[async_trait]
    impl TaskExecutor for Completing {
        async fn execute(&self, _id: String, input: String, callback: Arc<dyn TaskCallback>, _cancel: CancellationToken) {
            callback.send(MessageType::StatusUpdate { message: format!("working on {}", input) });
            callback.send(MessageType::TaskComplete {
                result: TaskResult::planner_done("done", 1, Vec::new()),
            });
        }
    }

    /// 等到取消后再发一条迟到消息
    struct Blocking;

    #[async_trait]
    impl TaskExecutor for Blocking {
        async fn execute(&self, _id: String, _input: String, callback: Arc<dyn TaskCallback>, cancel: CancellationToken) {
            cancel.cancelled().await;
            callback.send(MessageType::StatusUpdate { message: "late".into() });
            callback.send(MessageType::TaskError { error: "late error".into() });
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskExecutor for Panicking {
        async fn execute(&self, _id: String, _input: String, _callback: Arc<dyn TaskCallback>, _cancel: CancellationToken) {
            panic!("boom");
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_executor_and_detects_completion() {
        let m = manager(2);
        let snap = m.start("t1", "open example.com", Arc::new(Completing)).unwrap();
        assert_eq!(snap.status, TaskStatus::Running);
        assert_eq!(m.active_task().as_deref(), Some("t1"));
        // task_start 已记录，执行器尚未运行
        assert_eq!(m.recent_messages("t1", 10).len(), 1);

        settle().await;
        let snap = m.status("t1").unwrap();
        assert_eq!(snap.status, TaskStatus::Completed);
        assert!(snap.end_time.is_some());
        assert!(snap.result.unwrap().success);
        let kinds: Vec<&str> = m
            .recent_messages("t1", 10)
            .iter()
            .map(|g| g.message.type_name())
            .collect();
        assert_eq!(kinds, vec!["task_start", "status_update", "task_complete"]);
        assert_eq!(m.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_deferred() {
        let m = manager(2);
        m.start("t1", "x", Arc::new(Completing)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(m.status("t1").unwrap().status, TaskStatus::Running);
        settle().await;
        assert_eq!(m.status("t1").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_control() {
        let m = manager(2);
        m.start("a", "x", Arc::new(Blocking)).unwrap();
        m.start("b", "x", Arc::new(Blocking)).unwrap();
        assert_eq!(
            m.start("c", "x", Arc::new(Blocking)).unwrap_err(),
            TaskManagerError::CapacityExceeded(2)
        );
        assert_eq!(
            m.start("a", "x", Arc::new(Blocking)).unwrap_err(),
            TaskManagerError::AlreadyRunning("a".into())
        );
        settle().await;
        assert!(m.cancel("a"));
        settle().await;
        assert!(m.start("c", "x", Arc::new(Blocking)).is_ok());
        assert_eq!(m.running_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_then_late_messages_do_not_change_status() {
        let m = manager(2);
        m.start("t1", "x", Arc::new(Blocking)).unwrap();
        settle().await;

        assert!(m.cancel("t1"));
        assert!(!m.cancel("t1"));
        assert!(!m.cancel("nope"));
        settle().await;

        let snap = m.status("t1").unwrap();
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert!(snap.error.is_none());
        let kinds: Vec<&str> = m
            .recent_messages("t1", 10)
            .iter()
            .map(|g| g.message.type_name())
            .collect();
        assert_eq!(kinds, vec!["task_start", "task_cancelled", "status_update", "task_error"]);
        let cancelled = m
            .broadcaster()
            .replay_snapshot()
            .iter()
            .filter(|g| g.message == MessageType::TaskCancelled)
            .count();
        assert_eq!(cancelled, 1);

        let replay = m.broadcaster().replay_snapshot();
        let broadcast: Vec<&str> = replay
            .iter()
            .filter(|g| g.task_id.as_deref() == Some("t1"))
            .map(|g| g.message.type_name())
            .collect();
        assert_eq!(broadcast, vec!["task_start", "task_cancelled", "status_update"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_executor_starts() {
        let m = manager(1);
        m.start("t1", "x", Arc::new(Completing)).unwrap();
        assert!(m.cancel("t1"));
        settle().await;
        assert_eq!(m.status("t1").unwrap().status, TaskStatus::Cancelled);
        // 许可已释放
        assert!(m.start("t2", "y", Arc::new(Completing)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_executor_reports_error() {
        let m = manager(2);
        m.start("t1", "x", Arc::new(Panicking)).unwrap();
        settle().await;
        let snap = m.status("t1").unwrap();
        assert_eq!(snap.status, TaskStatus::Error);
        assert!(snap.error.unwrap().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_limit_and_list() {
        let config = TaskManagerConfig {
            max_concurrent: 1,
            start_delay: Duration::from_millis(10),
            message_log_limit: 2,
            history_limit: 2,
        };
        let m = TaskManager::new(config, Arc::new(Broadcaster::new(50)));
        for id in ["a", "b", "c"] {
            m.start(id, "x", Arc::new(Completing)).unwrap();
            settle().await;
        }
        assert!(m.status("a").is_none());
        let ids: Vec<String> = m.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"b".to_string()) && ids.contains(&"c".to_string()));
        // 消息日志有界
        assert_eq!(m.status("c").unwrap().message_count, 2);
        assert_eq!(
            m.start("c", "again", Arc::new(Completing)).unwrap_err(),
            TaskManagerError::AlreadyFinished("c".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_and_empty_input() {
        let m = manager(3);
        assert_eq!(m.start("e", "  ", Arc::new(Completing)).unwrap_err(), TaskManagerError::EmptyInput);
        m.start("a", "x", Arc::new(Blocking)).unwrap();
        m.start("b", "x", Arc::new(Blocking)).unwrap();
        assert_eq!(m.cancel_all(), 2);
        assert_eq!(m.running_count(), 0);
    }
}
