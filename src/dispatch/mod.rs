//! 策略分发：把准入后的提交交给三种执行策略之一
//!
//! 每种策略都执行同一流程：Agent 解析 → 执行新建或复用（经准入控制）→ 交互关联 → 元数据快照 →
//! 初始进度事件 → 交付（入队或直连流）。
//!
//! - **Holistic**：多 Agent 研究，优先 workflow 类型 Agent，入队一个 `PLAN` 单元到 research-coordinator 队列
//! - **Direct**：单 Agent 流式对话，不经队列，直接交付实时流句柄
//! - **SingleAgent**：指定或动态选择的 Agent，使用其 max_steps，入队到独立队列（与 Holistic 隔离）
//!
//! 交付只发生在准入锁释放、执行与交互写入完成之后，worker 不会看到写了一半的状态。
//! 同步分发错误（找不到 Agent、队列不可达）统一转换为 failed 执行 + 带 `Error: ` 前缀的回答。

mod agents;
mod direct;

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

pub use agents::{AgentKind, AgentQuery, AgentRef, AgentResolver, StaticAgentResolver};
pub use direct::{DirectHandle, DirectRequest, DirectRunner, DirectStream, LiveStreams};

use crate::admission::{Admission, AdmissionController};
use crate::config::DispatchSection;
use crate::core::{ExecutionContext, ExecutionState, OrchestratorError, Result, Strategy};
use crate::queue::{JobQueue, QueueError, WorkKind, WorkUnit};
use crate::registry::{EventSource, Execution, ExecutionRegistry, Interaction};
use crate::status::StatusReporter;

/// 失败回答的前缀
pub const ERROR_PREFIX: &str = "Error: ";

/// 分发结果
#[derive(Debug)]
pub enum DispatchOutcome {
    /// 已入队（Holistic / SingleAgent）
    Queued {
        execution: Execution,
        interaction: Interaction,
        batch_id: String,
    },
    /// 直连流已打开（Direct）
    Streaming {
        execution: Execution,
        interaction: Interaction,
        handle: DirectHandle,
    },
    /// 复用在途工作，未重复交付
    Reused { execution: Execution, interaction: Interaction },
    /// 被活跃执行阻塞
    Blocked { execution: Execution },
    /// 执行在交付前已结束（如被取消），未交付
    Settled { execution: Execution, interaction: Interaction },
    /// 同步分发失败；数据模型已保持一致
    Failed {
        execution: Option<Execution>,
        interaction: Interaction,
        error: OrchestratorError,
    },
}

impl DispatchOutcome {
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::Queued { execution, .. }
            | Self::Streaming { execution, .. }
            | Self::Reused { execution, .. }
            | Self::Settled { execution, .. }
            | Self::Blocked { execution } => Some(&execution.id),
            Self::Failed { execution, .. } => execution.as_ref().map(|e| e.id.as_str()),
        }
    }

    pub fn interaction(&self) -> Option<&Interaction> {
        match self {
            Self::Queued { interaction, .. }
            | Self::Streaming { interaction, .. }
            | Self::Reused { interaction, .. }
            | Self::Settled { interaction, .. }
            | Self::Failed { interaction, .. } => Some(interaction),
            Self::Blocked { .. } => None,
        }
    }
}

/// 记录一次失败：执行标记 failed（幂等）、回答写入错误、追加错误事件、清除流式标记
///
/// `execution_id` 为空时（执行尚未创建）只处理交互。返回本次是否完成了失败迁移。
pub(crate) async fn record_failure(
    registry: &ExecutionRegistry,
    reporter: &StatusReporter,
    execution_id: Option<&str>,
    interaction_id: &str,
    message: &str,
) -> Result<bool> {
    let applied = match execution_id {
        Some(id) => registry.mark_failed(id, message).await?.is_applied(),
        None => true,
    };

    if applied {
        let answer = format!("{}{}", ERROR_PREFIX, message);
        registry.write_answer(interaction_id, &answer).await?;
        reporter
            .report_with(interaction_id, EventSource::System, answer, None, true)
            .await?;
    }
    registry.set_streaming(interaction_id, false).await?;
    Ok(applied)
}

/// 策略分发器
pub struct StrategyDispatcher {
    registry: ExecutionRegistry,
    reporter: StatusReporter,
    admission: Arc<AdmissionController>,
    resolver: Arc<dyn AgentResolver>,
    queue: Arc<dyn JobQueue>,
    direct: Arc<dyn DirectRunner>,
    streams: Arc<LiveStreams>,
    config: DispatchSection,
}

impl StrategyDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ExecutionRegistry,
        reporter: StatusReporter,
        admission: Arc<AdmissionController>,
        resolver: Arc<dyn AgentResolver>,
        queue: Arc<dyn JobQueue>,
        direct: Arc<dyn DirectRunner>,
        streams: Arc<LiveStreams>,
        config: DispatchSection,
    ) -> Self {
        Self {
            registry,
            reporter,
            admission,
            resolver,
            queue,
            direct,
            streams,
            config,
        }
    }

    /// 分发一次提交
    pub async fn dispatch(&self, ctx: &ExecutionContext, input: &str) -> Result<DispatchOutcome> {
        let input = input.trim();

        let agent = match self.resolve_agent(ctx, input).await {
            Ok(agent) => agent,
            Err(e) if e.is_dispatch_failure() => return self.fail_unadmitted(ctx, input, e).await,
            Err(e) => return Err(e),
        };

        let max_steps = match ctx.strategy {
            Strategy::Holistic => self.config.holistic_max_steps,
            Strategy::Direct | Strategy::SingleAgent => agent.max_steps,
        };

        let (execution, interaction) = match self.admission.submit(ctx, input, max_steps).await? {
            Admission::Accepted { execution, interaction } => (execution, interaction),
            Admission::Reused { execution, interaction } => {
                return Ok(DispatchOutcome::Reused { execution, interaction });
            }
            Admission::Blocked { execution } => return Ok(DispatchOutcome::Blocked { execution }),
        };

        let queue = self.queue_for(ctx.strategy);
        self.write_snapshot(&execution, &agent, queue).await?;
        self.reporter
            .report(
                &interaction.id,
                EventSource::Orchestrator,
                format!("Dispatched to {} ({} strategy)", agent.name, ctx.strategy),
            )
            .await?;

        match ctx.strategy {
            Strategy::Holistic => {
                self.enqueue(execution, interaction, &agent, WorkKind::Plan, &self.config.holistic_queue)
                    .await
            }
            Strategy::SingleAgent => {
                self.enqueue(
                    execution,
                    interaction,
                    &agent,
                    WorkKind::SingleAgent,
                    &self.config.single_agent_queue,
                )
                .await
            }
            Strategy::Direct => self.open_stream(execution, interaction, agent).await,
        }
    }

    fn queue_for(&self, strategy: Strategy) -> Option<&str> {
        match strategy {
            Strategy::Holistic => Some(&self.config.holistic_queue),
            Strategy::SingleAgent => Some(&self.config.single_agent_queue),
            Strategy::Direct => None,
        }
    }

    async fn resolve_agent(&self, ctx: &ExecutionContext, input: &str) -> Result<AgentRef> {
        if let Some(id) = ctx.agent_id.as_deref() {
            return self
                .resolver
                .resolve(AgentQuery::Id(id))
                .await
                .ok_or_else(|| OrchestratorError::AgentNotFound(id.to_string()));
        }

        let resolved = match ctx.strategy {
            Strategy::Holistic => match self.resolver.resolve(AgentQuery::Kind(AgentKind::Workflow)).await {
                Some(agent) => Some(agent),
                None => self.resolver.resolve(AgentQuery::Any).await,
            },
            Strategy::Direct => match self.resolver.resolve(AgentQuery::Kind(AgentKind::Chat)).await {
                Some(agent) => Some(agent),
                None => self.resolver.resolve(AgentQuery::Any).await,
            },
            Strategy::SingleAgent => self.resolver.resolve(AgentQuery::ForInput(input)).await,
        };
        resolved.ok_or(OrchestratorError::NoAgentsAvailable)
    }

    /// 执行创建前的失败：仍给出一条带错误回答的交互；若已有在途工作则按准入结果返回
    async fn fail_unadmitted(
        &self,
        ctx: &ExecutionContext,
        input: &str,
        error: OrchestratorError,
    ) -> Result<DispatchOutcome> {
        match self.admission.evaluate(ctx, input).await? {
            Some(Admission::Reused { execution, interaction }) => {
                return Ok(DispatchOutcome::Reused { execution, interaction });
            }
            Some(Admission::Blocked { execution }) => return Ok(DispatchOutcome::Blocked { execution }),
            Some(Admission::Accepted { .. }) | None => {}
        }

        warn!(session_id = %ctx.session_id, strategy = %ctx.strategy, "dispatch failed before admission: {}", error);

        let interaction = Interaction::new(&ctx.session_id, &ctx.user_id, input);
        self.registry.create_interaction(&interaction).await?;
        record_failure(&self.registry, &self.reporter, None, &interaction.id, &error.to_string()).await?;

        let interaction = self.registry.interaction(&interaction.id).await?.unwrap_or(interaction);
        Ok(DispatchOutcome::Failed {
            execution: None,
            interaction,
            error,
        })
    }

    /// 执行已创建后的失败
    async fn fail_admitted(
        &self,
        execution: Execution,
        interaction: Interaction,
        error: OrchestratorError,
    ) -> Result<DispatchOutcome> {
        warn!(execution_id = %execution.id, "dispatch failed: {}", error);
        record_failure(
            &self.registry,
            &self.reporter,
            Some(&execution.id),
            &interaction.id,
            &error.to_string(),
        )
        .await?;

        let execution = self.registry.get(&execution.id).await?.unwrap_or(execution);
        let interaction = self.registry.interaction(&interaction.id).await?.unwrap_or(interaction);
        Ok(DispatchOutcome::Failed {
            execution: Some(execution),
            interaction,
            error,
        })
    }

    /// 执行已在别处结束：不再交付，只清理流式标记
    async fn settled(&self, execution: Execution, interaction: Interaction) -> Result<DispatchOutcome> {
        info!(execution_id = %execution.id, state = %execution.state, "execution settled before hand-off");
        self.registry.set_streaming(&interaction.id, false).await?;
        let interaction = self.registry.interaction(&interaction.id).await?.unwrap_or(interaction);
        Ok(DispatchOutcome::Settled { execution, interaction })
    }

    async fn write_snapshot(&self, execution: &Execution, agent: &AgentRef, queue: Option<&str>) -> Result<()> {
        let mut snapshot = serde_json::Map::new();
        snapshot.insert("agent_id".to_string(), json!(agent.id));
        snapshot.insert("agent_name".to_string(), json!(agent.name));
        snapshot.insert("agent_kind".to_string(), json!(agent.kind));
        snapshot.insert("strategy".to_string(), json!(execution.strategy));
        snapshot.insert("max_steps".to_string(), json!(execution.max_steps));
        if let Some(queue) = queue {
            snapshot.insert("queue".to_string(), json!(queue));
        }
        if let Some(tool_override) = &execution.tool_override {
            snapshot.insert("tool_override".to_string(), serde_json::to_value(tool_override)?);
        }
        self.registry.merge_metadata(&execution.id, snapshot).await
    }

    async fn enqueue(
        &self,
        execution: Execution,
        interaction: Interaction,
        agent: &AgentRef,
        kind: WorkKind,
        queue: &str,
    ) -> Result<DispatchOutcome> {
        let execution = self.registry.require(&execution.id).await?;
        if execution.is_terminal() {
            return self.settled(execution, interaction).await;
        }

        let unit = WorkUnit {
            kind,
            execution_id: execution.id.clone(),
            interaction_id: interaction.id.clone(),
            agent_id: agent.id.clone(),
            input: execution.input.clone(),
            max_steps: execution.max_steps,
            tool_override: execution.tool_override.clone(),
        };

        match self.queue.enqueue(queue, unit).await {
            Ok(batch_id) => {
                self.registry.attach_batch(&execution.id, &batch_id).await?;
                let execution = self.registry.get(&execution.id).await?.unwrap_or(execution);
                if execution.is_terminal() {
                    // 入队与关联批次之间被取消：取消方看不到批次，由这里收回
                    match self.queue.cancel_batch(&batch_id).await {
                        Ok(()) | Err(QueueError::BatchFinished(_)) => {}
                        Err(e) => warn!(execution_id = %execution.id, batch_id = %batch_id, "batch cancel failed: {}", e),
                    }
                    return self.settled(execution, interaction).await;
                }
                info!(execution_id = %execution.id, queue = %queue, batch_id = %batch_id, "execution enqueued");
                Ok(DispatchOutcome::Queued {
                    execution,
                    interaction,
                    batch_id,
                })
            }
            Err(e) => {
                let reason = match e {
                    QueueError::Unavailable(reason) => reason,
                    other => other.to_string(),
                };
                self.fail_admitted(execution, interaction, OrchestratorError::QueueUnavailable(reason))
                    .await
            }
        }
    }

    async fn open_stream(
        &self,
        execution: Execution,
        interaction: Interaction,
        agent: AgentRef,
    ) -> Result<DispatchOutcome> {
        let execution = match self.registry.transition(&execution.id, ExecutionState::Executing).await {
            Ok(execution) => execution,
            Err(OrchestratorError::InvalidTransition { .. }) => {
                let execution = self.registry.require(&execution.id).await?;
                return self.settled(execution, interaction).await;
            }
            Err(e) => return Err(e),
        };
        self.registry.set_streaming(&interaction.id, true).await?;
        let cancel = self.streams.register(&execution.id).await;

        // 注册令牌前到达的取消找不到流，这里补一次检查
        let current = self.registry.require(&execution.id).await?;
        if current.is_terminal() {
            self.streams.release(&execution.id).await;
            return self.settled(current, interaction).await;
        }

        let request = DirectRequest {
            execution_id: execution.id.clone(),
            interaction_id: interaction.id.clone(),
            agent,
            input: execution.input.clone(),
            max_steps: execution.max_steps,
            tool_override: execution.tool_override.clone(),
            cancel: cancel.clone(),
        };

        match self.direct.open(request).await {
            Ok(stream) => {
                info!(execution_id = %execution.id, "direct stream opened");
                let interaction = Interaction {
                    is_streaming: true,
                    ..interaction
                };
                Ok(DispatchOutcome::Streaming {
                    handle: DirectHandle {
                        execution_id: execution.id.clone(),
                        interaction_id: interaction.id.clone(),
                        cancel,
                        stream,
                    },
                    execution,
                    interaction,
                })
            }
            Err(e) => {
                self.streams.release(&execution.id).await;
                self.fail_admitted(execution, interaction, e).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures_util::stream;
    use tokio::sync::Mutex;

    use super::*;
    use crate::core::SessionMarkers;
    use crate::queue::{BatchId, BatchStatus, InProcessQueue};
    use crate::status::NoopBroadcaster;

    struct CountingRunner {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl DirectRunner for CountingRunner {
        async fn open(&self, _request: DirectRequest) -> Result<DirectStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(stream::pending::<String>()))
        }
    }

    /// 入队成功后立即取消执行，模拟入队与关联批次之间到达的取消
    struct CancelOnEnqueue {
        inner: InProcessQueue,
        registry: ExecutionRegistry,
        last_batch: Mutex<Option<BatchId>>,
    }

    #[async_trait]
    impl JobQueue for CancelOnEnqueue {
        async fn enqueue(&self, queue: &str, unit: WorkUnit) -> std::result::Result<BatchId, QueueError> {
            let batch_id = self.inner.enqueue(queue, unit.clone()).await?;
            self.registry
                .mark_cancelled(&unit.execution_id)
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            *self.last_batch.lock().await = Some(batch_id.clone());
            Ok(batch_id)
        }

        async fn cancel_batch(&self, batch_id: &str) -> std::result::Result<(), QueueError> {
            self.inner.cancel_batch(batch_id).await
        }

        async fn batch_status(&self, batch_id: &str) -> std::result::Result<BatchStatus, QueueError> {
            self.inner.batch_status(batch_id).await
        }
    }

    struct Fixture {
        dispatcher: StrategyDispatcher,
        registry: ExecutionRegistry,
        admission: Arc<AdmissionController>,
        runner: Arc<CountingRunner>,
        streams: Arc<LiveStreams>,
    }

    fn fixture(registry: ExecutionRegistry, queue: Arc<dyn JobQueue>) -> Fixture {
        let reporter = StatusReporter::new(registry.clone(), Arc::new(NoopBroadcaster));
        let admission = Arc::new(AdmissionController::new(
            registry.clone(),
            Arc::new(SessionMarkers::default()),
            1200,
        ));
        let runner = Arc::new(CountingRunner {
            opened: AtomicUsize::new(0),
        });
        let streams = Arc::new(LiveStreams::new());
        let dispatcher = StrategyDispatcher::new(
            registry.clone(),
            reporter,
            Arc::clone(&admission),
            Arc::new(StaticAgentResolver::default().with_agent(AgentRef::new("chat", AgentKind::Chat, 5))),
            queue,
            runner.clone(),
            Arc::clone(&streams),
            DispatchSection::default(),
        );
        Fixture {
            dispatcher,
            registry,
            admission,
            runner,
            streams,
        }
    }

    async fn admitted(f: &Fixture, strategy: Strategy) -> (Execution, Interaction) {
        let ctx = ExecutionContext::new("S1", "U1", strategy);
        match f.admission.submit(&ctx, "Explain X", 5).await.unwrap() {
            Admission::Accepted { execution, interaction } => (execution, interaction),
            other => panic!("expected accepted, got {:?}", other.kind()),
        }
    }

    fn chat() -> AgentRef {
        AgentRef::new("chat", AgentKind::Chat, 5)
    }

    #[tokio::test]
    async fn test_stream_not_opened_for_cancelled_execution() {
        let queue = Arc::new(InProcessQueue::new());
        let f = fixture(ExecutionRegistry::in_memory(), queue);
        let (execution, interaction) = admitted(&f, Strategy::Direct).await;
        f.registry.mark_cancelled(&execution.id).await.unwrap();

        let outcome = f.dispatcher.open_stream(execution, interaction, chat()).await.unwrap();
        let DispatchOutcome::Settled { execution, interaction } = outcome else {
            panic!("expected settled outcome");
        };
        assert_eq!(execution.state, ExecutionState::Cancelled);
        assert!(!interaction.is_streaming);
        assert_eq!(f.runner.opened.load(Ordering::SeqCst), 0);
        assert_eq!(f.streams.len().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_execution_is_not_enqueued() {
        let queue = Arc::new(InProcessQueue::new());
        let mut rx = queue.register_queue("single-agent").await;
        let f = fixture(ExecutionRegistry::in_memory(), queue);
        let (execution, interaction) = admitted(&f, Strategy::SingleAgent).await;
        f.registry.mark_cancelled(&execution.id).await.unwrap();

        let outcome = f
            .dispatcher
            .enqueue(execution, interaction, &chat(), WorkKind::SingleAgent, "single-agent")
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Settled { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_racing_enqueue_reclaims_batch() {
        let registry = ExecutionRegistry::in_memory();
        let inner = InProcessQueue::new();
        let _rx = inner.register_queue("single-agent").await;
        let queue = Arc::new(CancelOnEnqueue {
            inner,
            registry: registry.clone(),
            last_batch: Mutex::new(None),
        });
        let f = fixture(registry, queue.clone());
        let (execution, interaction) = admitted(&f, Strategy::SingleAgent).await;

        let outcome = f
            .dispatcher
            .enqueue(execution, interaction, &chat(), WorkKind::SingleAgent, "single-agent")
            .await
            .unwrap();
        let DispatchOutcome::Settled { execution, .. } = outcome else {
            panic!("expected settled outcome");
        };
        assert_eq!(execution.state, ExecutionState::Cancelled);

        let batch_id = queue.last_batch.lock().await.clone().unwrap();
        assert_eq!(queue.batch_status(&batch_id).await.unwrap(), BatchStatus::Cancelled);
    }
}
