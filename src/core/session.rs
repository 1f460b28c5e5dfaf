//! 会话标记：断线重连后的一次性「已重连」标记
//!
//! Reconnection Handler 写入，Admission Controller 消费；按 (session, user) 区分，仅内存持有，过期自动失效。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::context::SessionKey;

/// 单个 (session, user) 上的重连标记
#[derive(Debug, Clone)]
pub struct ReconnectMarker {
    pub execution_id: String,
    pub interaction_id: String,
    pub set_at: Instant,
}

impl ReconnectMarker {
    fn is_expired(&self, window: Duration) -> bool {
        self.set_at.elapsed() > window
    }
}

/// 会话级标记表
pub struct SessionMarkers {
    markers: RwLock<HashMap<SessionKey, ReconnectMarker>>,
    window: Duration,
}

impl SessionMarkers {
    pub fn new(window_secs: u64) -> Self {
        Self {
            markers: RwLock::new(HashMap::new()),
            window: Duration::from_secs(window_secs),
        }
    }

    /// 设置（或覆盖）重连标记
    pub async fn mark_reconnected(&self, key: &SessionKey, execution_id: &str, interaction_id: &str) {
        self.markers.write().await.insert(
            key.clone(),
            ReconnectMarker {
                execution_id: execution_id.to_string(),
                interaction_id: interaction_id.to_string(),
                set_at: Instant::now(),
            },
        );
    }

    /// 取出并清除标记；过期标记视为不存在
    pub async fn take(&self, key: &SessionKey) -> Option<ReconnectMarker> {
        let marker = self.markers.write().await.remove(key)?;
        if marker.is_expired(self.window) {
            return None;
        }
        Some(marker)
    }

    pub async fn is_marked(&self, key: &SessionKey) -> bool {
        self.markers
            .read()
            .await
            .get(key)
            .map(|m| !m.is_expired(self.window))
            .unwrap_or(false)
    }

    /// 清理过期标记
    pub async fn cleanup_expired(&self) -> usize {
        let mut markers = self.markers.write().await;
        let before = markers.len();
        markers.retain(|_, m| !m.is_expired(self.window));
        before - markers.len()
    }
}

impl Default for SessionMarkers {
    fn default() -> Self {
        Self::new(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str) -> SessionKey {
        SessionKey::new("s1", user)
    }

    #[tokio::test]
    async fn test_marker_is_consumed_once() {
        let markers = SessionMarkers::new(60);
        markers.mark_reconnected(&key("u1"), "exec_1", "int_1").await;
        assert!(markers.is_marked(&key("u1")).await);

        let marker = markers.take(&key("u1")).await.unwrap();
        assert_eq!(marker.execution_id, "exec_1");
        assert!(markers.take(&key("u1")).await.is_none());
    }

    #[tokio::test]
    async fn test_marker_belongs_to_one_user() {
        let markers = SessionMarkers::new(60);
        markers.mark_reconnected(&key("u1"), "exec_1", "int_1").await;

        assert!(!markers.is_marked(&key("u2")).await);
        assert!(markers.take(&key("u2")).await.is_none());
        assert!(markers.take(&key("u1")).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_marker_is_ignored() {
        let markers = SessionMarkers::new(0);
        markers.mark_reconnected(&key("u1"), "exec_1", "int_1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(markers.take(&key("u1")).await.is_none());
        assert_eq!(markers.cleanup_expired().await, 0);
    }
}
