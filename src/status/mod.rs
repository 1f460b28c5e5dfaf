//! 进度汇报：每个交互一条追加写的事件日志，外加尽力而为的广播
//!
//! 推送（广播）与拉取（`get_events`）都是同一份持久日志的投影；UI 不依赖收到每一条广播。

mod broadcast;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

pub use broadcast::{BroadcastError, BroadcastMessage, Broadcaster, ChannelBroadcaster, NoopBroadcaster};

use crate::core::Result;
use crate::registry::{EventSource, ExecutionRegistry, NewStatusEvent, StatusEvent};

/// 交互事件的广播频道名
pub fn interaction_channel(interaction_id: &str) -> String {
    format!("interaction:{}", interaction_id)
}

/// 进度汇报器
#[derive(Clone)]
pub struct StatusReporter {
    registry: ExecutionRegistry,
    broadcaster: Arc<dyn Broadcaster>,
}

impl StatusReporter {
    pub fn new(registry: ExecutionRegistry, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { registry, broadcaster }
    }

    /// 追加一条普通事件
    pub async fn report(&self, interaction_id: &str, source: EventSource, message: impl Into<String>) -> Result<StatusEvent> {
        self.report_with(interaction_id, source, message, None, false).await
    }

    /// 追加事件并广播；广播失败只记日志
    pub async fn report_with(
        &self,
        interaction_id: &str,
        source: EventSource,
        message: impl Into<String>,
        duration: Option<Duration>,
        significant: bool,
    ) -> Result<StatusEvent> {
        let event = self
            .registry
            .store()
            .append_event(NewStatusEvent {
                interaction_id: interaction_id.to_string(),
                source,
                message: message.into(),
                timestamp: Utc::now(),
                duration_ms: duration.map(|d| d.as_millis() as u64),
                significant,
            })
            .await?;

        let payload = json!({
            "type": "status",
            "event": event,
        });
        if let Err(e) = self.broadcaster.publish(&interaction_channel(interaction_id), payload) {
            tracing::debug!(interaction_id = %interaction_id, "status broadcast dropped: {}", e);
        }

        Ok(event)
    }

    /// 完整事件历史（按序号 / 时间升序），可重复调用
    pub async fn get_events(&self, interaction_id: &str) -> Result<Vec<StatusEvent>> {
        self.registry.store().list_events(interaction_id).await
    }
}
