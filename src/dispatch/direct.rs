//! Direct 策略的流式通道
//!
//! 不经队列：分发器直接向调用方交付一个实时流句柄，无需轮询。
//! 每个直连流登记一个取消令牌，取消执行时一并触发。

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::agents::AgentRef;
use crate::core::{Result, ToolOverride};

/// 流式输出（文本片段）
pub type DirectStream = BoxStream<'static, String>;

/// 打开直连流的请求
#[derive(Debug, Clone)]
pub struct DirectRequest {
    pub execution_id: String,
    pub interaction_id: String,
    pub agent: AgentRef,
    pub input: String,
    pub max_steps: u32,
    pub tool_override: Option<ToolOverride>,
    /// 执行被取消时触发；实现应据此停止产出
    pub cancel: CancellationToken,
}

/// 直连流执行者（真实的 LLM 流式调用，在核心之外实现）
#[async_trait]
pub trait DirectRunner: Send + Sync {
    async fn open(&self, request: DirectRequest) -> Result<DirectStream>;
}

/// 交给调用方的流句柄
pub struct DirectHandle {
    pub execution_id: String,
    pub interaction_id: String,
    pub cancel: CancellationToken,
    pub stream: DirectStream,
}

impl fmt::Debug for DirectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectHandle")
            .field("execution_id", &self.execution_id)
            .field("interaction_id", &self.interaction_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// 在途直连流的取消令牌表
#[derive(Default)]
pub struct LiveStreams {
    tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl LiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, execution_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.write().await.insert(execution_id.to_string(), token.clone());
        token
    }

    /// 触发并移除；返回是否存在在途流
    pub async fn cancel(&self, execution_id: &str) -> bool {
        match self.tokens.write().await.remove(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn release(&self, execution_id: &str) {
        self.tokens.write().await.remove(execution_id);
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}
