//! 作业队列适配层
//!
//! 真实的 Agent 工作在独立的后台 worker 上运行，worker 从命名队列拉取工作单元。
//! 核心只依赖 [`JobQueue`] 接口：入队、取消批次、查询批次状态。
//!
//! 自带一个进程内实现（[`InProcessQueue`] + [`QueueWorker`]），用于单进程部署与测试。

mod in_process;
mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_process::{InProcessQueue, QueuedJob};
pub use worker::{QueueWorker, WorkHandler, WorkerContext};

use crate::core::ToolOverride;

/// 批次 ID
pub type BatchId = String;

/// 工作单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkKind {
    /// Holistic 策略的规划单元
    Plan,
    /// SingleAgent 策略的执行单元
    SingleAgent,
}

/// 交给 worker 的工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub kind: WorkKind,
    pub execution_id: String,
    pub interaction_id: String,
    pub agent_id: String,
    pub input: String,
    pub max_steps: u32,
    pub tool_override: Option<ToolOverride>,
}

/// 批次状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown batch: {0}")]
    UnknownBatch(String),

    /// 批次已结束；取消时不视为错误
    #[error("Batch already finished: {0}")]
    BatchFinished(String),
}

/// 作业队列接口
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 入队一个工作单元，返回其批次
    async fn enqueue(&self, queue: &str, unit: WorkUnit) -> Result<BatchId, QueueError>;

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), QueueError>;

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, QueueError>;
}
