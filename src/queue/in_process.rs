//! 进程内命名队列
//!
//! 每个命名队列一条 mpsc 通道，批次元数据保存在内存表中；worker 通过 [`InProcessQueue::register_queue`]
//! 拿到待执行接收端。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use super::{BatchId, BatchStatus, JobQueue, QueueError, WorkUnit};

/// 队列中的一个批次
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub batch_id: BatchId,
    pub queue: String,
    pub unit: WorkUnit,
    pub status: BatchStatus,
    pub error: Option<String>,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// 进程内作业队列
#[derive(Default)]
pub struct InProcessQueue {
    /// 所有批次
    batches: RwLock<HashMap<BatchId, QueuedJob>>,
    /// 队列名 -> 待执行发送端
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<BatchId>>>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册命名队列，返回待执行接收端；重复注册会替换旧的接收端
    pub async fn register_queue(&self, name: &str) -> mpsc::UnboundedReceiver<BatchId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().await.insert(name.to_string(), tx);
        rx
    }

    pub async fn get(&self, batch_id: &str) -> Option<QueuedJob> {
        self.batches.read().await.get(batch_id).cloned()
    }

    /// Queued → Running；其他状态（如已取消）返回 false
    pub async fn start(&self, batch_id: &str) -> bool {
        let mut batches = self.batches.write().await;
        match batches.get_mut(batch_id) {
            Some(job) if job.status == BatchStatus::Queued => {
                job.status = BatchStatus::Running;
                job.started_at = Some(chrono::Utc::now().timestamp_millis());
                true
            }
            _ => false,
        }
    }

    /// 记录批次结束；已结束的批次保持原状态
    pub async fn finish(&self, batch_id: &str, status: BatchStatus, error: Option<String>) {
        let mut batches = self.batches.write().await;
        if let Some(job) = batches.get_mut(batch_id) {
            if job.status.is_finished() {
                return;
            }
            job.status = status;
            job.error = error;
            job.completed_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// 清理已结束的旧批次
    pub async fn cleanup_finished(&self, max_age_hours: u64) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - (max_age_hours as i64 * 3600 * 1000);
        let mut batches = self.batches.write().await;
        let before = batches.len();
        batches.retain(|_, job| {
            !(job.status.is_finished() && job.completed_at.map(|c| c < cutoff).unwrap_or(false))
        });
        before - batches.len()
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, queue: &str, unit: WorkUnit) -> Result<BatchId, QueueError> {
        let sender = self
            .senders
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::Unavailable(format!("no worker registered for queue {}", queue)))?;

        let batch_id = format!("batch_{}", uuid::Uuid::new_v4());
        self.batches.write().await.insert(
            batch_id.clone(),
            QueuedJob {
                batch_id: batch_id.clone(),
                queue: queue.to_string(),
                unit,
                status: BatchStatus::Queued,
                error: None,
                created_at: chrono::Utc::now().timestamp_millis(),
                started_at: None,
                completed_at: None,
            },
        );

        if sender.send(batch_id.clone()).is_err() {
            self.batches.write().await.remove(&batch_id);
            return Err(QueueError::Unavailable(format!("worker for queue {} has stopped", queue)));
        }

        tracing::debug!(queue = %queue, batch_id = %batch_id, "work unit enqueued");
        Ok(batch_id)
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), QueueError> {
        let mut batches = self.batches.write().await;
        let job = batches
            .get_mut(batch_id)
            .ok_or_else(|| QueueError::UnknownBatch(batch_id.to_string()))?;
        if job.status.is_finished() {
            return Err(QueueError::BatchFinished(batch_id.to_string()));
        }
        job.status = BatchStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now().timestamp_millis());
        Ok(())
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, QueueError> {
        self.batches
            .read()
            .await
            .get(batch_id)
            .map(|job| job.status)
            .ok_or_else(|| QueueError::UnknownBatch(batch_id.to_string()))
    }
}
