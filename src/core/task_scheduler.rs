//! 任务准入：用 Semaphore 限制同时运行的任务数
//!
//! 许可由执行器持有，执行器返回时释放（包括取消后执行器真正退出的时刻）。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// 立即尝试获取许可；已满时返回 None（不排队）
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 当前空闲的许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(2)
    }
}
