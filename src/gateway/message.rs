//! 客户端协议
//!
//! 出站消息统一包成 GatewayMessage（id / task_id / timestamp + 按 "type" 标记的正文）；
//! 入站请求直接是按 "type" 标记的 ClientRequest。

use serde::{Deserialize, Serialize};

use crate::agents::TaskResult;
use crate::core::TaskSnapshot;

/// 出站消息正文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// 任务开始
    TaskStart {
        task: String,
    },

    /// 执行过程中的进度
    StatusUpdate {
        message: String,
    },

    /// 任务正常结束（成功、失败、步数耗尽、超时）
    TaskComplete {
        result: TaskResult,
    },

    /// 循环本身出错
    TaskError {
        error: String,
    },

    TaskCancelled,

    /// attach 完成后发给新连接的最后一条消息
    Connected {
        connection_id: String,
        active_task: Option<String>,
    },

    /// get_status 的回复；没有活动任务时 status 为空
    StatusResponse {
        status: Option<TaskSnapshot>,
    },

    /// 请求无法处理
    Error {
        code: String,
        message: String,
    },

    /// 原样带回 ping 的时间戳（外层 timestamp 是服务端时间）
    Pong {
        echo: u64,
    },
}

impl MessageType {
    /// task_complete / task_error 会把任务转入终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageType::TaskComplete { .. } | MessageType::TaskError { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MessageType::TaskStart { .. } => "task_start",
            MessageType::StatusUpdate { .. } => "status_update",
            MessageType::TaskComplete { .. } => "task_complete",
            MessageType::TaskError { .. } => "task_error",
            MessageType::TaskCancelled => "task_cancelled",
            MessageType::Connected { .. } => "connected",
            MessageType::StatusResponse { .. } => "status_response",
            MessageType::Error { .. } => "error",
            MessageType::Pong { .. } => "pong",
        }
    }
}

/// 网关消息（带元信息的完整消息），创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// 消息 ID
    pub id: String,
    /// 所属任务
    #[serde(default)]
    pub task_id: Option<String>,
    /// 消息正文（"type" 与其字段平铺在顶层）
    #[serde(flatten)]
    pub message: MessageType,
    /// 时间戳（毫秒）
    pub timestamp: u64,
}

impl GatewayMessage {
    pub fn new(task_id: Option<String>, message: MessageType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
            message,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    pub fn for_task(task_id: &str, message: MessageType) -> Self {
        Self::new(Some(task_id.to_string()), message)
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            None,
            MessageType::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        )
    }

    pub fn pong(echo: u64) -> Self {
        Self::new(None, MessageType::Pong { echo })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// 入站请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    GetStatus,

    NewTask {
        task: String,
    },

    /// 不带 task_id 时取消当前活动任务
    CancelTask {
        #[serde(default)]
        task_id: Option<String>,
    },

    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}
