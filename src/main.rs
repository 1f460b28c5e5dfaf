//! Hive - 单进程演示入口
//!
//! 初始化日志与配置，组装进程内队列 + worker，提交命令行给出的问题并打印事件流与结果。
//! 用法：`hive [holistic|direct|single_agent] <问题...>`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream;
use hive::config::load_config;
use hive::dispatch::{AgentKind, AgentRef, DirectRequest, DirectRunner, DirectStream, StaticAgentResolver};
use hive::queue::{InProcessQueue, QueueWorker, WorkHandler, WorkerContext};
use hive::registry::EventSource;
use hive::status::ChannelBroadcaster;
use hive::{
    observability, DispatchOutcome, ExecutionContext, ExecutionState, Orchestrator, OrchestratorError, Strategy,
};

/// 回显处理器：走完规划 / 执行 / 综合三个阶段
struct EchoHandler;

#[async_trait]
impl WorkHandler for EchoHandler {
    async fn handle(&self, ctx: &WorkerContext) -> Result<String, String> {
        for (state, source) in [
            (ExecutionState::Planning, EventSource::Planner),
            (ExecutionState::Executing, EventSource::Agent),
            (ExecutionState::Synthesizing, EventSource::Synthesizer),
        ] {
            if ctx.should_abort().await {
                return Err("aborted".to_string());
            }
            ctx.advance(state).await.map_err(|e| e.to_string())?;
            ctx.progress(source, format!("{} step for agent {}", state, ctx.unit.agent_id))
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(format!("Echo: {}", ctx.unit.input))
    }
}

/// 按词切分输入的直连流
struct EchoRunner;

#[async_trait]
impl DirectRunner for EchoRunner {
    async fn open(&self, request: DirectRequest) -> hive::core::Result<DirectStream> {
        let words: Vec<String> = request.input.split_whitespace().map(|w| format!("{} ", w)).collect();
        Ok(Box::pin(stream::iter(words)))
    }
}

fn parse_args() -> (Strategy, String) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let strategy = match args.first().and_then(|a| a.parse::<Strategy>().ok()) {
        Some(strategy) => {
            args.remove(0);
            strategy
        }
        None => Strategy::SingleAgent,
    };
    let input = if args.is_empty() {
        "Explain the borrow checker".to_string()
    } else {
        args.join(" ")
    };
    (strategy, input)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let (strategy, input) = parse_args();

    let queue = Arc::new(InProcessQueue::new());
    let holistic_rx = queue.register_queue(&config.dispatch.holistic_queue).await;
    let single_rx = queue.register_queue(&config.dispatch.single_agent_queue).await;

    let broadcaster = Arc::new(ChannelBroadcaster::new(config.broadcast.capacity));
    let mut bus = broadcaster.subscribe();

    let resolver = StaticAgentResolver::default()
        .with_agent(AgentRef::new("research-lead", AgentKind::Workflow, 50).with_name("Research Lead"))
        .with_agent(AgentRef::new("chat", AgentKind::Chat, 5).with_name("Chat"))
        .with_agent(AgentRef::new("rustacean", AgentKind::Specialist, 20).with_tags(&["rust", "borrow", "cargo"]));

    let orchestrator = Arc::new(
        Orchestrator::builder(config.clone())
            .with_broadcaster(broadcaster)
            .with_resolver(Arc::new(resolver))
            .with_queue(queue.clone())
            .with_direct_runner(Arc::new(EchoRunner))
            .build()
            .await,
    );

    let handler: Arc<dyn WorkHandler> = Arc::new(EchoHandler);
    for rx in [holistic_rx, single_rx] {
        let worker = QueueWorker::new(queue.clone(), orchestrator.clone(), config.worker.max_concurrent);
        tokio::spawn(worker.start(rx, handler.clone()));
    }

    tokio::spawn(async move {
        while let Ok(msg) = bus.recv().await {
            tracing::debug!(channel = %msg.channel, "{}", msg.payload);
        }
    });

    let ctx = ExecutionContext::new("cli", "local", strategy);
    let outcome = orchestrator.submit(&ctx, &input).await.context("Submit failed")?;

    let (execution_id, interaction_id) = match outcome {
        DispatchOutcome::Streaming { execution, interaction, handle } => {
            orchestrator.finish_stream(handle).await.context("Stream failed")?;
            (execution.id, interaction.id)
        }
        DispatchOutcome::Queued { execution, interaction, .. }
        | DispatchOutcome::Reused { execution, interaction }
        | DispatchOutcome::Settled { execution, interaction } => (execution.id, interaction.id),
        DispatchOutcome::Blocked { execution } => {
            return Err(OrchestratorError::AdmissionBlocked(execution.id).into());
        }
        DispatchOutcome::Failed { interaction, error, .. } => {
            println!("{}", interaction.answer.unwrap_or_default());
            anyhow::bail!(error)
        }
    };

    loop {
        let snapshot = orchestrator.poll_execution(&execution_id).await?;
        if snapshot.state.is_terminal() {
            for event in orchestrator.get_events(&interaction_id).await? {
                println!("[{}] {}: {}", event.timestamp.format("%H:%M:%S%.3f"), event.source, event.message);
            }
            println!("\n{} => {}", snapshot.state, snapshot.output.or(snapshot.error).unwrap_or_default());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
