//! 广播 / 事件总线（尽力而为，至多一次）
//!
//! WebSocket 传输本身在核心之外；这里只定义发布接口与一个基于 tokio broadcast 的进程内实现。

use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("No subscribers on channel {0}")]
    NoSubscribers(String),

    #[error("Broadcast failed: {0}")]
    Failed(String),
}

/// 发布到总线的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub channel: String,
    pub payload: serde_json::Value,
}

/// 广播接口：发布失败只返回错误，调用方决定是否忽略
pub trait Broadcaster: Send + Sync {
    fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<(), BroadcastError>;
}

/// 进程内广播（tokio broadcast channel）
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 订阅所有频道；慢订阅者会丢消息（Lagged），应回源 `get_events`
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<(), BroadcastError> {
        self.tx
            .send(BroadcastMessage {
                channel: channel.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BroadcastError::NoSubscribers(channel.to_string()))
    }
}

/// 丢弃所有消息
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn publish(&self, _channel: &str, _payload: serde_json::Value) -> Result<(), BroadcastError> {
        Ok(())
    }
}
