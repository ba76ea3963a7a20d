//! 核心编排层：错误类型、任务准入、任务生命周期管理、优雅关闭

pub mod error;
pub mod shutdown;
pub mod task_manager;
pub mod task_scheduler;

pub use error::{AgentError, GatewayError, TaskManagerError};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, TaskManagerCleanup};
pub use task_manager::{
    TaskCallback, TaskExecutor, TaskManager, TaskManagerConfig, TaskSnapshot, TaskStatus,
};
pub use task_scheduler::TaskScheduler;
