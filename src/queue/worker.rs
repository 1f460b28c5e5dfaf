//! 后台 worker：从命名队列拉取批次并执行
//!
//! 协作式取消：开始前、结束后都重新读取执行状态；执行已 cancelled 时放弃提交副作用。
//! 处理器在步骤之间应调用 [`WorkerContext::should_abort`]。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use super::{BatchId, BatchStatus, InProcessQueue, WorkUnit};
use crate::core::{ExecutionState, Result};
use crate::orchestrator::Orchestrator;
use crate::registry::{EventSource, Execution, StatusEvent};

/// 工作单元处理器（真实的 LLM / 工具执行，在核心之外实现）
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// 返回最终输出；错误信息会写入失败的执行
    async fn handle(&self, ctx: &WorkerContext) -> std::result::Result<String, String>;
}

/// 交给处理器的上下文：工作单元 + 汇报接口
pub struct WorkerContext {
    pub batch_id: BatchId,
    pub unit: WorkUnit,
    orchestrator: Arc<Orchestrator>,
}

impl WorkerContext {
    /// 推进执行阶段
    pub async fn advance(&self, state: ExecutionState) -> Result<Execution> {
        self.orchestrator.advance(&self.unit.execution_id, state).await
    }

    pub async fn progress(&self, source: EventSource, message: impl Into<String>) -> Result<StatusEvent> {
        self.orchestrator
            .report_progress(&self.unit.execution_id, source, message, None)
            .await
    }

    pub async fn progress_timed(
        &self,
        source: EventSource,
        message: impl Into<String>,
        duration: Duration,
    ) -> Result<StatusEvent> {
        self.orchestrator
            .report_progress(&self.unit.execution_id, source, message, Some(duration))
            .await
    }

    /// 执行是否已被取消（或已由他处结束）
    pub async fn should_abort(&self) -> bool {
        self.orchestrator
            .should_abort(&self.unit.execution_id)
            .await
            .unwrap_or(true)
    }
}

/// 队列 worker
pub struct QueueWorker {
    queue: Arc<InProcessQueue>,
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
}

impl QueueWorker {
    pub fn new(queue: Arc<InProcessQueue>, orchestrator: Arc<Orchestrator>, max_concurrent: usize) -> Self {
        Self {
            queue,
            orchestrator,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 启动 worker，直到接收端关闭
    pub async fn start(self, mut pending_rx: mpsc::UnboundedReceiver<BatchId>, handler: Arc<dyn WorkHandler>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        while let Some(batch_id) = pending_rx.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let queue = Arc::clone(&self.queue);
            let orchestrator = Arc::clone(&self.orchestrator);
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                let _permit = permit;
                run_batch(queue, orchestrator, handler, batch_id).await;
            });
        }
    }
}

async fn run_batch(
    queue: Arc<InProcessQueue>,
    orchestrator: Arc<Orchestrator>,
    handler: Arc<dyn WorkHandler>,
    batch_id: BatchId,
) {
    if !queue.start(&batch_id).await {
        tracing::debug!(batch_id = %batch_id, "batch no longer queued, skipping");
        return;
    }
    let Some(job) = queue.get(&batch_id).await else {
        return;
    };

    let ctx = WorkerContext {
        batch_id: batch_id.clone(),
        unit: job.unit,
        orchestrator: Arc::clone(&orchestrator),
    };

    if ctx.should_abort().await {
        queue.finish(&batch_id, BatchStatus::Cancelled, None).await;
        return;
    }

    let execution_id = ctx.unit.execution_id.clone();
    match handler.handle(&ctx).await {
        Ok(output) => {
            if ctx.should_abort().await {
                tracing::info!(execution_id = %execution_id, "execution cancelled mid-flight, dropping output");
                queue.finish(&batch_id, BatchStatus::Cancelled, None).await;
                return;
            }
            if let Err(e) = orchestrator.complete(&execution_id, output).await {
                tracing::warn!(execution_id = %execution_id, "failed to record completion: {}", e);
            }
            queue.finish(&batch_id, BatchStatus::Completed, None).await;
        }
        Err(error) => {
            if let Err(e) = orchestrator.fail(&execution_id, error.clone()).await {
                tracing::warn!(execution_id = %execution_id, "failed to record failure: {}", e);
            }
            queue.finish(&batch_id, BatchStatus::Failed, Some(error)).await;
        }
    }
}
