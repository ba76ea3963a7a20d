//! 连接与广播层
//!
//! - 每条广播消息尝试投递给所有在线连接；某个连接发送失败只把它标记为断开，不重试
//! - 所有消息都进入容量 20 的重放缓冲区（FIFO）
//! - 广播时没有任何在线连接，消息另存入待发队列，下一个 attach 的连接先收到它们
//! - attach 顺序：待发队列 -> 活动任务最近 3 条 -> 一条 connected

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::message::{GatewayMessage, MessageType};
use crate::core::GatewayError;

/// 重放缓冲区容量
pub const REPLAY_CAPACITY: usize = 20;
/// attach 时重放的活动任务消息条数
pub const REPLAY_ON_ATTACH: usize = 3;

/// 一个客户端连接；tx 是写往传输层的通道
#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<String>,
    connected: bool,
    /// 毫秒时间戳
    last_activity: i64,
}

impl Connection {
    fn send(&mut self, id: &str, json: &str) -> bool {
        if !self.connected {
            return false;
        }
        if self.tx.send(json.to_string()).is_err() {
            tracing::warn!(connection_id = id, "send failed, marking connection disconnected");
            self.connected = false;
            return false;
        }
        true
    }
}

#[derive(Debug, Default)]
struct State {
    connections: HashMap<String, Connection>,
    pending: VecDeque<GatewayMessage>,
    replay: VecDeque<GatewayMessage>,
    active_task: Option<String>,
}

/// 广播器：所有状态在一把锁内，attach 与 broadcast 互斥
#[derive(Debug)]
pub struct Broadcaster {
    state: Mutex<State>,
    pending_capacity: usize,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn encode(message: &GatewayMessage) -> Option<String> {
    match message.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, kind = message.message.type_name(), "message serialize failed");
            None
        }
    }
}

impl Broadcaster {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            pending_capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 注册连接并补发历史；返回补发的消息数（不含 connected）
    pub fn attach(&self, connection_id: impl Into<String>, tx: mpsc::UnboundedSender<String>) -> usize {
        let id = connection_id.into();
        let mut guard = self.state();
        let state = &mut *guard;
        let mut conn = Connection {
            tx,
            connected: true,
            last_activity: now_ms(),
        };

        let pending: Vec<GatewayMessage> = state.pending.drain(..).collect();
        let active = state.active_task.clone();
        let recent: Vec<GatewayMessage> = match &active {
            Some(task_id) => {
                let mut tail: Vec<GatewayMessage> = state
                    .replay
                    .iter()
                    .rev()
                    .filter(|m| m.task_id.as_deref() == Some(task_id.as_str()))
                    .take(REPLAY_ON_ATTACH)
                    .cloned()
                    .collect();
                tail.reverse();
                tail
            }
            None => Vec::new(),
        };

        let mut replayed = 0;
        for message in pending.iter().chain(recent.iter()) {
            if let Some(json) = encode(message) {
                if conn.send(&id, &json) {
                    replayed += 1;
                }
            }
        }

        let connected = GatewayMessage::new(
            None,
            MessageType::Connected {
                connection_id: id.clone(),
                active_task: active,
            },
        );
        if let Some(json) = encode(&connected) {
            conn.send(&id, &json);
        }

        tracing::info!(
            connection_id = %id,
            pending = pending.len(),
            replayed,
            "connection attached"
        );
        state.connections.insert(id, conn);
        replayed
    }

    /// 移除连接；之后不再向它投递
    pub fn detach(&self, connection_id: &str) -> bool {
        let removed = self.state().connections.remove(connection_id).is_some();
        if removed {
            tracing::info!(connection_id, "connection detached");
        }
        removed
    }

    /// 投递给所有在线连接并写入重放缓冲区；返回成功投递数
    pub fn broadcast(&self, message: GatewayMessage) -> usize {
        let mut guard = self.state();
        let state = &mut *guard;

        let mut delivered = 0;
        if let Some(json) = encode(&message) {
            for (id, conn) in state.connections.iter_mut() {
                if conn.send(id, &json) {
                    delivered += 1;
                }
            }
        }

        // 没有任何连接收到（含传输已断但尚未 detach 的连接）时进入待发队列
        if delivered == 0 {
            if state.pending.len() >= self.pending_capacity {
                state.pending.pop_front();
            }
            if self.pending_capacity > 0 {
                state.pending.push_back(message.clone());
            }
        }

        if state.replay.len() >= REPLAY_CAPACITY {
            state.replay.pop_front();
        }
        state.replay.push_back(message);
        delivered
    }

    /// 直接回复某个连接（不进重放缓冲区）
    pub fn send_to(&self, connection_id: &str, message: &GatewayMessage) -> Result<(), GatewayError> {
        let json = message.to_json()?;
        let mut state = self.state();
        let conn = state
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(connection_id.to_string()))?;
        if conn.send(connection_id, &json) {
            Ok(())
        } else {
            Err(GatewayError::SendFailed(connection_id.to_string()))
        }
    }

    /// 更新连接最后活动时间
    pub fn touch(&self, connection_id: &str) {
        if let Some(conn) = self.state().connections.get_mut(connection_id) {
            conn.last_activity = now_ms();
        }
    }

    pub fn last_activity(&self, connection_id: &str) -> Option<i64> {
        self.state().connections.get(connection_id).map(|c| c.last_activity)
    }

    pub fn set_active_task(&self, task_id: Option<String>) {
        self.state().active_task = task_id;
    }

    pub fn active_task(&self) -> Option<String> {
        self.state().active_task.clone()
    }

    /// 在线连接数
    pub fn connection_count(&self) -> usize {
        self.state().connections.values().filter(|c| c.connected).count()
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.state()
            .connections
            .get(connection_id)
            .map(|c| c.connected)
            .unwrap_or(false)
    }

    /// 重放缓冲区快照（旧到新）
    pub fn replay_snapshot(&self) -> Vec<GatewayMessage> {
        self.state().replay.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(50)
    }
}
