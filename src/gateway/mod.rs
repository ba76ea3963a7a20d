//! 网关：客户端协议、连接与广播层、WebSocket 服务（feature "gateway"）
//!
//! 任务管理器把每条任务消息交给 Broadcaster；Broadcaster 扇出到在线连接并保留重放缓冲区，
//! 晚加入的连接先收到待发队列与活动任务的最近几条消息。

pub mod broadcast;
pub mod message;
#[cfg(feature = "gateway")]
pub mod server;

pub use broadcast::{Broadcaster, REPLAY_CAPACITY, REPLAY_ON_ATTACH};
pub use message::{ClientRequest, GatewayMessage, MessageType};
#[cfg(feature = "gateway")]
pub use server::{handle_request, GatewayServer};
