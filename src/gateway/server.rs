//! WebSocket 网关
//!
//! 每个连接：握手 -> attach 到广播器（补发历史 + connected）-> 读循环分发请求 -> detach。
//! 任务进度不经这里转发，由任务管理器交给广播器统一推送。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::message::{ClientRequest, GatewayMessage, MessageType};
use crate::core::{GatewayError, TaskExecutor, TaskManager};

/// 网关服务
pub struct GatewayServer {
    bind_addr: String,
    manager: TaskManager,
    executor: Arc<dyn TaskExecutor>,
}

impl GatewayServer {
    pub fn new(bind_addr: impl Into<String>, manager: TaskManager, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            manager,
            executor,
        }
    }

    /// 监听直到 shutdown 触发
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        let addr: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|e| GatewayError::InvalidAddress(format!("{}: {}", self.bind_addr, e)))?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        tracing::info!("Gateway listening on ws://{}", addr);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Gateway stopped accepting connections");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let manager = self.manager.clone();
                        let executor = Arc::clone(&self.executor);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, manager, executor, shutdown).await {
                                tracing::warn!(%peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept error"),
                },
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: TaskManager,
    executor: Arc<dyn TaskExecutor>,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| GatewayError::Handshake(e.to_string()))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = format!("conn_{}", uuid::Uuid::new_v4());

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let broadcaster = Arc::clone(manager.broadcaster());
    broadcaster.attach(connection_id.clone(), tx);
    tracing::info!(%peer, connection_id = %connection_id, "client connected");

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        };
        match msg {
            WsMessage::Text(text) => {
                broadcaster.touch(&connection_id);
                if let Some(reply) = handle_request(&text, &manager, &executor) {
                    if let Err(e) = broadcaster.send_to(&connection_id, &reply) {
                        tracing::warn!(connection_id = %connection_id, error = %e, "reply failed");
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    broadcaster.detach(&connection_id);
    tracing::info!(%peer, connection_id = %connection_id, "client disconnected");
    Ok(())
}

/// 分发一条入站请求；返回需要直接回复给该连接的消息
pub fn handle_request(
    text: &str,
    manager: &TaskManager,
    executor: &Arc<dyn TaskExecutor>,
) -> Option<GatewayMessage> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => return Some(GatewayMessage::error("parse_error", &e.to_string())),
    };

    match request {
        ClientRequest::GetStatus => Some(GatewayMessage::new(
            manager.active_task(),
            MessageType::StatusResponse {
                status: manager.active_status(),
            },
        )),
        ClientRequest::NewTask { task } => {
            let task_id = uuid::Uuid::new_v4().to_string();
            match manager.start(task_id, task, Arc::clone(executor)) {
                Ok(_) => None,
                Err(e) => Some(GatewayMessage::error("task_rejected", &e.to_string())),
            }
        }
        ClientRequest::CancelTask { task_id } => {
            let Some(task_id) = task_id.or_else(|| manager.active_task()) else {
                return Some(GatewayMessage::error("no_active_task", "No task to cancel"));
            };
            if manager.cancel(&task_id) {
                None
            } else {
                Some(GatewayMessage::error(
                    "not_running",
                    &format!("Task {} is not running", task_id),
                ))
            }
        }
        ClientRequest::Ping { timestamp } => Some(GatewayMessage::pong(timestamp)),
    }
}
