//! 编排门面：组装各组件，对外暴露提交 / 轮询 / 重连 / 取消，对 worker 暴露汇报接口
//!
//! 核心从不等待 worker 完成：`submit` 只负责准入与交付，结果通过状态日志与 `poll_execution` 观察。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::cancel::CancellationManager;
use crate::config::AppConfig;
use crate::core::{ExecutionContext, ExecutionState, OrchestratorError, Result, SessionMarkers, Strategy};
use crate::dispatch::{
    record_failure, AgentResolver, DirectHandle, DirectRequest, DirectRunner, DirectStream, DispatchOutcome,
    LiveStreams, StaticAgentResolver, StrategyDispatcher,
};
use crate::queue::{BatchStatus, InProcessQueue, JobQueue, QueueError};
use crate::reconnect::{ReconnectResult, ReconnectionHandler};
use crate::registry::{
    create_store, EventSource, Execution, ExecutionRegistry, Interaction, NewExecution, StatusEvent, TerminalOutcome,
};
use crate::status::{Broadcaster, ChannelBroadcaster, StatusReporter};

/// 轮询结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub state: ExecutionState,
    pub output: Option<String>,
    pub error: Option<String>,
    pub batch_status: Option<BatchStatus>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    fn new(execution: Execution, batch_status: Option<BatchStatus>) -> Self {
        Self {
            id: execution.id,
            state: execution.state,
            output: execution.output,
            error: execution.error,
            batch_status,
            updated_at: execution.updated_at,
        }
    }
}

/// 未配置直连执行者时使用：打开即失败，按分发失败处理
struct UnconfiguredDirectRunner;

#[async_trait]
impl DirectRunner for UnconfiguredDirectRunner {
    async fn open(&self, _request: DirectRequest) -> Result<DirectStream> {
        Err(OrchestratorError::QueueUnavailable("no direct runner configured".to_string()))
    }
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: Option<ExecutionRegistry>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    resolver: Option<Arc<dyn AgentResolver>>,
    queue: Option<Arc<dyn JobQueue>>,
    direct: Option<Arc<dyn DirectRunner>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            broadcaster: None,
            resolver: None,
            queue: None,
            direct: None,
        }
    }

    /// 指定注册表（默认按 [storage] 段创建）
    pub fn with_registry(mut self, registry: ExecutionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AgentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_direct_runner(mut self, direct: Arc<dyn DirectRunner>) -> Self {
        self.direct = Some(direct);
        self
    }

    pub async fn build(self) -> Orchestrator {
        let config = self.config;
        let registry = match self.registry {
            Some(registry) => registry,
            None => ExecutionRegistry::new(create_store(config.storage.database_path.as_deref()).await),
        };
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(ChannelBroadcaster::new(config.broadcast.capacity)));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticAgentResolver::default()));
        let queue = self.queue.unwrap_or_else(|| Arc::new(InProcessQueue::new()));
        let direct = self.direct.unwrap_or_else(|| Arc::new(UnconfiguredDirectRunner));

        let reporter = StatusReporter::new(registry.clone(), broadcaster);
        let markers = Arc::new(SessionMarkers::new(config.admission.reconnect_window_secs));
        let streams = Arc::new(LiveStreams::new());
        let admission = Arc::new(AdmissionController::new(
            registry.clone(),
            Arc::clone(&markers),
            config.admission.stale_after_secs,
        ));
        let dispatcher = StrategyDispatcher::new(
            registry.clone(),
            reporter.clone(),
            admission,
            resolver,
            Arc::clone(&queue),
            direct,
            Arc::clone(&streams),
            config.dispatch.clone(),
        );
        let reconnection = ReconnectionHandler::new(registry.clone(), reporter.clone(), Arc::clone(&markers));
        let cancellation = CancellationManager::new(
            registry.clone(),
            reporter.clone(),
            Arc::clone(&queue),
            Arc::clone(&streams),
        );

        Orchestrator {
            registry,
            reporter,
            markers,
            dispatcher,
            reconnection,
            cancellation,
            queue,
            streams,
        }
    }
}

/// 编排器
pub struct Orchestrator {
    registry: ExecutionRegistry,
    reporter: StatusReporter,
    markers: Arc<SessionMarkers>,
    dispatcher: StrategyDispatcher,
    reconnection: ReconnectionHandler,
    cancellation: CancellationManager,
    queue: Arc<dyn JobQueue>,
    streams: Arc<LiveStreams>,
}

impl Orchestrator {
    pub fn builder(config: AppConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    // ---- 对外接口 ----

    /// 提交一次用户输入
    pub async fn submit(&self, ctx: &ExecutionContext, input: &str) -> Result<DispatchOutcome> {
        let outcome = self.dispatcher.dispatch(ctx, input).await?;
        match &outcome {
            DispatchOutcome::Queued { execution, batch_id, .. } => {
                info!(session_id = %ctx.session_id, execution_id = %execution.id, batch_id = %batch_id, "submission accepted")
            }
            DispatchOutcome::Streaming { execution, .. } => {
                info!(session_id = %ctx.session_id, execution_id = %execution.id, "submission streaming")
            }
            DispatchOutcome::Reused { execution, .. } => {
                info!(session_id = %ctx.session_id, execution_id = %execution.id, "submission reused in-flight execution")
            }
            DispatchOutcome::Blocked { execution } => {
                info!(session_id = %ctx.session_id, blocking_id = %execution.id, "submission blocked")
            }
            DispatchOutcome::Settled { execution, .. } => {
                info!(session_id = %ctx.session_id, execution_id = %execution.id, state = %execution.state, "submission settled before hand-off")
            }
            DispatchOutcome::Failed { error, .. } => {
                info!(session_id = %ctx.session_id, "submission failed: {}", error)
            }
        }
        Ok(outcome)
    }

    /// 查询执行状态；批次已失败而执行仍非终态时就地标记失败
    pub async fn poll_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot> {
        let execution = self.registry.require(execution_id).await?;
        let Some(batch_id) = execution.batch_id.clone() else {
            return Ok(ExecutionSnapshot::new(execution, None));
        };

        let batch_status = match self.queue.batch_status(&batch_id).await {
            Ok(status) => Some(status),
            Err(QueueError::UnknownBatch(_)) => None,
            Err(e) => {
                warn!(execution_id = %execution_id, batch_id = %batch_id, "batch status unavailable: {}", e);
                None
            }
        };

        if !execution.is_terminal() && batch_status == Some(BatchStatus::Failed) {
            warn!(execution_id = %execution_id, batch_id = %batch_id, "batch failed without reporting, failing execution");
            self.fail(execution_id, format!("Worker batch {} failed", batch_id)).await?;
            let execution = self.registry.require(execution_id).await?;
            return Ok(ExecutionSnapshot::new(execution, batch_status));
        }

        Ok(ExecutionSnapshot::new(execution, batch_status))
    }

    pub async fn reconnect(&self, session_id: &str, interaction_id: &str) -> Result<ReconnectResult> {
        self.reconnection.reconnect(session_id, interaction_id).await
    }

    pub async fn cancel(&self, execution_id: &str, user_id: &str) -> Result<Execution> {
        self.cancellation.cancel(execution_id, user_id).await
    }

    pub async fn cancel_all_active_for_session(&self, session_id: &str, user_id: &str) -> Result<Vec<Execution>> {
        self.cancellation.cancel_all_active_for_session(session_id, user_id).await
    }

    pub async fn get_events(&self, interaction_id: &str) -> Result<Vec<StatusEvent>> {
        self.reporter.get_events(interaction_id).await
    }

    /// 会话的交互历史（按创建时间）
    pub async fn history(&self, session_id: &str) -> Result<Vec<Interaction>> {
        self.registry.list_interactions(session_id).await
    }

    pub async fn is_workflow_active(&self, execution_id: &str) -> Result<bool> {
        self.registry.is_workflow_active(execution_id).await
    }

    /// 清理过期的重连标记
    pub async fn cleanup_expired_markers(&self) -> usize {
        self.markers.cleanup_expired().await
    }

    // ---- worker 接口 ----

    /// 推进执行阶段并记录一条阶段事件（子执行记到工作流的交互上）
    pub async fn advance(&self, execution_id: &str, state: ExecutionState) -> Result<Execution> {
        let execution = self.registry.transition(execution_id, state).await?;
        if let Some(interaction) = self.registry.interaction_for_workflow(execution_id).await? {
            let message = match execution.parent_execution_id {
                Some(_) => format!("Child {} phase: {}", execution_id, state),
                None => format!("Phase: {}", state),
            };
            self.reporter
                .report(&interaction.id, EventSource::Orchestrator, message)
                .await?;
        }
        Ok(execution)
    }

    /// 追加一条进度事件，同时刷新执行的更新时间
    pub async fn report_progress(
        &self,
        execution_id: &str,
        source: EventSource,
        message: impl Into<String>,
        duration: Option<std::time::Duration>,
    ) -> Result<StatusEvent> {
        let interaction = self
            .registry
            .interaction_for_workflow(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("interaction for execution {}", execution_id)))?;
        self.registry.touch(execution_id).await?;
        self.reporter
            .report_with(&interaction.id, source, message, duration, false)
            .await
    }

    /// 记录完成；重复调用不产生重复事件
    pub async fn complete(&self, execution_id: &str, output: String) -> Result<TerminalOutcome> {
        let outcome = self.registry.mark_completed(execution_id, output.as_str()).await?;
        self.streams.release(execution_id).await;
        if !outcome.is_applied() {
            debug!(execution_id = %execution_id, "completion ignored, execution already terminal");
            return Ok(outcome);
        }

        let execution = outcome.execution();
        let elapsed = (Utc::now() - execution.created_at).to_std().ok();
        if let Some(interaction) = self.registry.interaction_for_execution(execution_id).await? {
            self.registry.write_answer(&interaction.id, &output).await?;
            self.registry.set_streaming(&interaction.id, false).await?;
            self.reporter
                .report_with(&interaction.id, EventSource::Orchestrator, "Execution completed", elapsed, true)
                .await?;
        } else if let Some(interaction) = self.registry.interaction_for_workflow(execution_id).await? {
            // 子执行的输出只进事件日志，回答由根执行写入
            self.reporter
                .report_with(
                    &interaction.id,
                    EventSource::Orchestrator,
                    format!("Child {} completed", execution_id),
                    elapsed,
                    false,
                )
                .await?;
        }
        info!(execution_id = %execution_id, "execution completed");
        Ok(outcome)
    }

    /// 记录失败；返回本次是否完成了失败迁移
    pub async fn fail(&self, execution_id: &str, error: String) -> Result<bool> {
        self.streams.release(execution_id).await;
        let applied = match self.registry.interaction_for_execution(execution_id).await? {
            Some(interaction) => {
                record_failure(&self.registry, &self.reporter, Some(execution_id), &interaction.id, &error).await?
            }
            None => {
                let applied = self.registry.mark_failed(execution_id, error.as_str()).await?.is_applied();
                if applied {
                    if let Some(interaction) = self.registry.interaction_for_workflow(execution_id).await? {
                        self.reporter
                            .report(
                                &interaction.id,
                                EventSource::System,
                                format!("Child {} failed: {}", execution_id, error),
                            )
                            .await?;
                    }
                }
                applied
            }
        };
        if applied {
            warn!(execution_id = %execution_id, "execution failed: {}", error);
        }
        Ok(applied)
    }

    /// 协作式取消检查：执行已处于终态时 worker 应停止
    pub async fn should_abort(&self, execution_id: &str) -> Result<bool> {
        Ok(self.registry.require(execution_id).await?.is_terminal())
    }

    /// 在工作流下派生子执行（继承会话、用户与步数上限）
    pub async fn spawn_child(&self, parent_id: &str, input: &str, strategy: Strategy) -> Result<Execution> {
        let parent = self.registry.require(parent_id).await?;
        let child = self
            .registry
            .create_child(
                parent_id,
                NewExecution {
                    session_id: parent.session_id.clone(),
                    user_id: parent.user_id.clone(),
                    strategy,
                    input: input.trim().to_string(),
                    max_steps: parent.max_steps,
                    tool_override: parent.tool_override.clone(),
                    parent_execution_id: None,
                },
            )
            .await?;
        self.registry.touch(parent_id).await?;
        debug!(parent_id = %parent_id, execution_id = %child.id, "child execution spawned");
        Ok(child)
    }

    /// 读完直连流并记录完成；流被取消时保留已收到的部分回答并返回当前执行
    pub async fn finish_stream(&self, handle: DirectHandle) -> Result<Execution> {
        let DirectHandle {
            execution_id,
            interaction_id,
            cancel,
            mut stream,
        } = handle;

        let mut output = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(execution_id = %execution_id, "direct stream cancelled before completion");
                    if !output.is_empty() {
                        self.registry.write_answer(&interaction_id, &output).await?;
                    }
                    self.registry.set_streaming(&interaction_id, false).await?;
                    return self.registry.require(&execution_id).await;
                }
                chunk = stream.next() => match chunk {
                    Some(chunk) => output.push_str(&chunk),
                    None => break,
                },
            }
        }

        Ok(self.complete(&execution_id, output).await?.execution().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{AgentKind, AgentRef};
    use crate::status::NoopBroadcaster;

    async fn orchestrator(queue: Arc<InProcessQueue>) -> Orchestrator {
        let resolver = StaticAgentResolver::default()
            .with_agent(AgentRef::new("researcher", AgentKind::Workflow, 50))
            .with_agent(AgentRef::new("coder", AgentKind::Specialist, 20));
        Orchestrator::builder(AppConfig::default())
            .with_registry(ExecutionRegistry::in_memory())
            .with_broadcaster(Arc::new(NoopBroadcaster))
            .with_resolver(Arc::new(resolver))
            .with_queue(queue)
            .build()
            .await
    }

    fn ctx(strategy: Strategy) -> ExecutionContext {
        ExecutionContext::new("S1", "U1", strategy)
    }

    #[tokio::test]
    async fn test_poll_fails_execution_whose_batch_failed() {
        let queue = Arc::new(InProcessQueue::new());
        let _rx = queue.register_queue("research-coordinator").await;
        let orch = orchestrator(Arc::clone(&queue)).await;

        let outcome = orch.submit(&ctx(Strategy::Holistic), "Explain X").await.unwrap();
        let DispatchOutcome::Queued { execution, interaction, batch_id } = outcome else {
            panic!("expected queued");
        };

        queue.finish(&batch_id, BatchStatus::Failed, Some("worker crashed".to_string())).await;

        let snapshot = orch.poll_execution(&execution.id).await.unwrap();
        assert_eq!(snapshot.state, ExecutionState::Failed);
        assert_eq!(snapshot.batch_status, Some(BatchStatus::Failed));

        // 再次轮询不产生新事件
        let before = orch.get_events(&interaction.id).await.unwrap().len();
        orch.poll_execution(&execution.id).await.unwrap();
        assert_eq!(orch.get_events(&interaction.id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let queue = Arc::new(InProcessQueue::new());
        let _rx = queue.register_queue("single-agent").await;
        let orch = orchestrator(queue).await;

        let outcome = orch.submit(&ctx(Strategy::SingleAgent), "fix the bug").await.unwrap();
        let exec_id = outcome.execution_id().unwrap().to_string();
        let interaction_id = outcome.interaction().unwrap().id.clone();

        assert!(orch.complete(&exec_id, "done".to_string()).await.unwrap().is_applied());
        let events = orch.get_events(&interaction_id).await.unwrap().len();
        assert!(!orch.complete(&exec_id, "again".to_string()).await.unwrap().is_applied());
        assert!(!orch.fail(&exec_id, "late".to_string()).await.unwrap());
        assert_eq!(orch.get_events(&interaction_id).await.unwrap().len(), events);

        let interaction = orch.registry().interaction(&interaction_id).await.unwrap().unwrap();
        assert_eq!(interaction.answer.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_spawn_child_keeps_workflow_active() {
        let queue = Arc::new(InProcessQueue::new());
        let _rx = queue.register_queue("research-coordinator").await;
        let orch = orchestrator(queue).await;

        let outcome = orch.submit(&ctx(Strategy::Holistic), "Explain X").await.unwrap();
        let parent = outcome.execution_id().unwrap().to_string();
        let child = orch.spawn_child(&parent, "sub task", Strategy::SingleAgent).await.unwrap();
        assert_eq!(child.parent_execution_id.as_deref(), Some(parent.as_str()));
        assert_eq!(child.session_id, "S1");

        orch.complete(&parent, "summary".to_string()).await.unwrap();
        assert!(orch.is_workflow_active(&parent).await.unwrap());

        orch.complete(&child.id, "part".to_string()).await.unwrap();
        assert!(!orch.is_workflow_active(&parent).await.unwrap());
        assert!(orch.should_abort(&child.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_without_runner_fails_cleanly() {
        let orch = orchestrator(Arc::new(InProcessQueue::new())).await;
        let outcome = orch.submit(&ctx(Strategy::Direct), "hello").await.unwrap();
        let DispatchOutcome::Failed { execution: Some(execution), interaction, .. } = outcome else {
            panic!("expected failure with execution");
        };
        assert_eq!(execution.state, ExecutionState::Failed);
        assert!(!interaction.is_streaming);
        assert!(interaction.answer.unwrap().starts_with("Error: "));
    }
}
