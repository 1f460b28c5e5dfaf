//! 取消：终止执行及其关联的队列批次
//!
//! 取消是协作式的：这里只翻转状态并请求取消批次 / 直连流，worker 在提交后续副作用前自行检查状态。
//! 已完成的部分工作不会回滚；交互尚无回答时写入取消提示。

use std::sync::Arc;

use tracing::{info, warn};

use crate::core::{OrchestratorError, Result};
use crate::dispatch::LiveStreams;
use crate::queue::{JobQueue, QueueError};
use crate::registry::{EventSource, Execution, ExecutionRegistry};
use crate::status::StatusReporter;

/// 取消后写入交互的回答
pub const CANCELLED_ANSWER: &str = "Cancelled by user.";

/// 取消管理器
pub struct CancellationManager {
    registry: ExecutionRegistry,
    reporter: StatusReporter,
    queue: Arc<dyn JobQueue>,
    streams: Arc<LiveStreams>,
}

impl CancellationManager {
    pub fn new(
        registry: ExecutionRegistry,
        reporter: StatusReporter,
        queue: Arc<dyn JobQueue>,
        streams: Arc<LiveStreams>,
    ) -> Self {
        Self {
            registry,
            reporter,
            queue,
            streams,
        }
    }

    /// 取消属于 `user_id` 的非终态执行
    pub async fn cancel(&self, execution_id: &str, user_id: &str) -> Result<Execution> {
        let not_found = || OrchestratorError::NotFound(format!("active execution {} for user {}", execution_id, user_id));

        let execution = self
            .registry
            .get(execution_id)
            .await?
            .filter(|e| e.user_id == user_id && e.state.is_active())
            .ok_or_else(not_found)?;

        let outcome = self.registry.mark_cancelled(&execution.id).await?;
        if !outcome.is_applied() {
            // 与 worker 的终态回调竞争失败：执行已在别处结束
            return Err(not_found());
        }
        let cancelled = outcome.execution().clone();

        if self.streams.cancel(&cancelled.id).await {
            info!(execution_id = %cancelled.id, "live stream cancelled");
        }

        if let Some(batch_id) = cancelled.batch_id.as_deref() {
            match self.queue.cancel_batch(batch_id).await {
                Ok(()) | Err(QueueError::BatchFinished(_)) => {}
                Err(e) => warn!(execution_id = %cancelled.id, batch_id = %batch_id, "batch cancel failed: {}", e),
            }
        }

        if let Some(interaction) = self.registry.interaction_for_execution(&cancelled.id).await? {
            self.registry.write_answer_if_empty(&interaction.id, CANCELLED_ANSWER).await?;
            self.registry.set_streaming(&interaction.id, false).await?;
            self.reporter
                .report_with(&interaction.id, EventSource::Orchestrator, "Execution cancelled", None, true)
                .await?;
        }

        info!(execution_id = %cancelled.id, user_id = %user_id, "execution cancelled");
        Ok(cancelled)
    }

    /// 取消 (session, user) 下所有非终态执行（包括已过期的）
    pub async fn cancel_all_active_for_session(&self, session_id: &str, user_id: &str) -> Result<Vec<Execution>> {
        let mut cancelled = Vec::new();
        for execution in self.registry.list_active_for_session(session_id, user_id).await? {
            match self.cancel(&execution.id, user_id).await {
                Ok(exec) => cancelled.push(exec),
                // 期间已结束
                Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionState, Strategy};
    use crate::queue::{BatchStatus, InProcessQueue, WorkKind, WorkUnit};
    use crate::registry::{Interaction, NewExecution};
    use crate::status::NoopBroadcaster;

    struct Fixture {
        manager: CancellationManager,
        registry: ExecutionRegistry,
        queue: Arc<InProcessQueue>,
    }

    fn fixture() -> Fixture {
        let registry = ExecutionRegistry::in_memory();
        let reporter = StatusReporter::new(registry.clone(), Arc::new(NoopBroadcaster));
        let queue = Arc::new(InProcessQueue::new());
        let manager = CancellationManager::new(
            registry.clone(),
            reporter,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::new(LiveStreams::new()),
        );
        Fixture { manager, registry, queue }
    }

    async fn linked(registry: &ExecutionRegistry, input: &str) -> (Execution, Interaction) {
        let exec = registry
            .create(NewExecution {
                session_id: "S1".to_string(),
                user_id: "U1".to_string(),
                strategy: Strategy::Holistic,
                input: input.to_string(),
                max_steps: 50,
                tool_override: None,
                parent_execution_id: None,
            })
            .await
            .unwrap();
        let interaction = Interaction::new("S1", "U1", input);
        registry.create_interaction(&interaction).await.unwrap();
        registry.link_interaction(&interaction.id, &exec.id).await.unwrap();
        (exec, interaction)
    }

    #[tokio::test]
    async fn test_cancel_planning_execution_and_batch() {
        let f = fixture();
        let _rx = f.queue.register_queue("research-coordinator").await;
        let (exec, interaction) = linked(&f.registry, "Explain X").await;
        let batch_id = f
            .queue
            .enqueue(
                "research-coordinator",
                WorkUnit {
                    kind: WorkKind::Plan,
                    execution_id: exec.id.clone(),
                    interaction_id: interaction.id.clone(),
                    agent_id: "planner".to_string(),
                    input: "Explain X".to_string(),
                    max_steps: 50,
                    tool_override: None,
                },
            )
            .await
            .unwrap();
        f.registry.attach_batch(&exec.id, &batch_id).await.unwrap();
        f.registry.transition(&exec.id, ExecutionState::Planning).await.unwrap();

        let cancelled = f.manager.cancel(&exec.id, "U1").await.unwrap();
        assert_eq!(cancelled.state, ExecutionState::Cancelled);
        assert_eq!(f.queue.batch_status(&batch_id).await.unwrap(), BatchStatus::Cancelled);

        let interaction = f.registry.interaction(&interaction.id).await.unwrap().unwrap();
        assert_eq!(interaction.answer.as_deref(), Some(CANCELLED_ANSWER));
    }

    #[tokio::test]
    async fn test_cancel_keeps_existing_answer() {
        let f = fixture();
        let (exec, interaction) = linked(&f.registry, "Explain X").await;
        f.registry.write_answer(&interaction.id, "partial findings").await.unwrap();

        f.manager.cancel(&exec.id, "U1").await.unwrap();
        let interaction = f.registry.interaction(&interaction.id).await.unwrap().unwrap();
        assert_eq!(interaction.answer.as_deref(), Some("partial findings"));
    }

    #[tokio::test]
    async fn test_cancel_rejects_foreign_or_finished() {
        let f = fixture();
        let (exec, _) = linked(&f.registry, "Explain X").await;

        assert!(matches!(f.manager.cancel(&exec.id, "U2").await, Err(OrchestratorError::NotFound(_))));
        assert_eq!(f.registry.get(&exec.id).await.unwrap().unwrap().state, ExecutionState::Pending);

        f.registry.mark_completed(&exec.id, "done").await.unwrap();
        assert!(matches!(f.manager.cancel(&exec.id, "U1").await, Err(OrchestratorError::NotFound(_))));
        assert!(matches!(f.manager.cancel("exec_missing", "U1").await, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_all_for_session() {
        let f = fixture();
        let (a, _) = linked(&f.registry, "one").await;
        let (b, _) = linked(&f.registry, "two").await;

        let cancelled = f.manager.cancel_all_active_for_session("S1", "U1").await.unwrap();
        assert_eq!(cancelled.len(), 2);
        for id in [&a.id, &b.id] {
            assert_eq!(f.registry.get(id).await.unwrap().unwrap().state, ExecutionState::Cancelled);
        }
        assert!(f.manager.cancel_all_active_for_session("S1", "U1").await.unwrap().is_empty());
    }
}
