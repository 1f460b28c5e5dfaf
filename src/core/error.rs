//! 编排错误类型
//!
//! 分类：可恢复（AdmissionBlocked）、缺陷/竞态（InvalidTransition）、配置（AgentNotFound / NoAgentsAvailable）、
//! 基础设施（QueueUnavailable / Storage）、拒绝（NotFound）。

use thiserror::Error;

use super::state::ExecutionState;

/// 编排核心对外暴露的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// 同一 (session, user) 已有活跃执行；用户可取消或等待
    #[error("Admission blocked by active execution {0}")]
    AdmissionBlocked(String),

    /// 非法状态迁移（始终记录日志，不吞掉）
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("No agents available")]
    NoAgentsAvailable,

    /// 队列不可达；执行被标记为 failed，核心内不自动重试
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// 未知或不属于该用户的执行 / 交互
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    /// 同步分发阶段的错误：由分发器转换为 failed 执行，而不是向调用方抛出
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound(_) | Self::NoAgentsAvailable | Self::QueueUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {}", e))
    }
}
