//! 断线重连：让刚加载的客户端重新挂到在途工作上
//!
//! 在途时为交互所属的 (session, user) 设置一次性重连标记（由准入控制消费一次，避免把恢复后的下一次操作误判为重复提交），
//! 并返回当前阶段与完整事件历史；否则提示无在途工作，客户端回退到已存储的回答。

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::core::{ExecutionState, OrchestratorError, Result, SessionKey, SessionMarkers};
use crate::registry::{ExecutionRegistry, StatusEvent};
use crate::status::StatusReporter;

/// 重连结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconnectResult {
    InFlight {
        execution_id: String,
        phase: ExecutionState,
        events: Vec<StatusEvent>,
    },
    NothingInFlight {
        /// 已存储的回答（可能为空）
        answer: Option<String>,
    },
}

/// 重连处理器
pub struct ReconnectionHandler {
    registry: ExecutionRegistry,
    reporter: StatusReporter,
    markers: Arc<SessionMarkers>,
}

impl ReconnectionHandler {
    pub fn new(registry: ExecutionRegistry, reporter: StatusReporter, markers: Arc<SessionMarkers>) -> Self {
        Self {
            registry,
            reporter,
            markers,
        }
    }

    pub async fn reconnect(&self, session_id: &str, interaction_id: &str) -> Result<ReconnectResult> {
        let interaction = self
            .registry
            .interaction(interaction_id)
            .await?
            .filter(|i| i.session_id == session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("interaction {} in session {}", interaction_id, session_id)))?;

        let execution = match interaction.execution_id.as_deref() {
            Some(id) => self.registry.get(id).await?,
            None => None,
        };

        match execution {
            Some(execution) if execution.state.is_active() => {
                let key = SessionKey::new(session_id, interaction.user_id.as_str());
                self.markers
                    .mark_reconnected(&key, &execution.id, &interaction.id)
                    .await;
                let events = self.reporter.get_events(&interaction.id).await?;
                info!(
                    session_id = %session_id,
                    execution_id = %execution.id,
                    phase = %execution.state,
                    "client reattached to in-flight execution"
                );
                Ok(ReconnectResult::InFlight {
                    execution_id: execution.id,
                    phase: execution.state,
                    events,
                })
            }
            _ => Ok(ReconnectResult::NothingInFlight {
                answer: interaction.answer,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Strategy;
    use crate::registry::{EventSource, Interaction, NewExecution};
    use crate::status::NoopBroadcaster;

    async fn setup() -> (ReconnectionHandler, ExecutionRegistry, StatusReporter, Arc<SessionMarkers>) {
        let registry = ExecutionRegistry::in_memory();
        let reporter = StatusReporter::new(registry.clone(), Arc::new(NoopBroadcaster));
        let markers = Arc::new(SessionMarkers::default());
        let handler = ReconnectionHandler::new(registry.clone(), reporter.clone(), Arc::clone(&markers));
        (handler, registry, reporter, markers)
    }

    async fn linked(registry: &ExecutionRegistry) -> (String, String) {
        let exec = registry
            .create(NewExecution {
                session_id: "S1".to_string(),
                user_id: "U1".to_string(),
                strategy: Strategy::Holistic,
                input: "Explain X".to_string(),
                max_steps: 50,
                tool_override: None,
                parent_execution_id: None,
            })
            .await
            .unwrap();
        let interaction = Interaction::new("S1", "U1", "Explain X");
        registry.create_interaction(&interaction).await.unwrap();
        registry.link_interaction(&interaction.id, &exec.id).await.unwrap();
        (exec.id, interaction.id)
    }

    #[tokio::test]
    async fn test_in_flight_returns_phase_and_history() {
        let (handler, registry, reporter, markers) = setup().await;
        let (exec_id, interaction_id) = linked(&registry).await;
        registry.transition(&exec_id, ExecutionState::Executing).await.unwrap();
        reporter.report(&interaction_id, EventSource::Orchestrator, "dispatched").await.unwrap();
        reporter.report(&interaction_id, EventSource::Agent, "step 1").await.unwrap();

        match handler.reconnect("S1", &interaction_id).await.unwrap() {
            ReconnectResult::InFlight { execution_id, phase, events } => {
                assert_eq!(execution_id, exec_id);
                assert_eq!(phase, ExecutionState::Executing);
                assert_eq!(events.len(), 2);
            }
            other => panic!("expected in-flight, got {:?}", other),
        }
        assert!(markers.is_marked(&SessionKey::new("S1", "U1")).await);
        assert!(!markers.is_marked(&SessionKey::new("S1", "U2")).await);
    }

    #[tokio::test]
    async fn test_terminal_execution_falls_back_to_answer() {
        let (handler, registry, _, markers) = setup().await;
        let (exec_id, interaction_id) = linked(&registry).await;
        registry.mark_completed(&exec_id, "X is...").await.unwrap();
        registry.write_answer(&interaction_id, "X is...").await.unwrap();

        assert_eq!(
            handler.reconnect("S1", &interaction_id).await.unwrap(),
            ReconnectResult::NothingInFlight {
                answer: Some("X is...".to_string())
            }
        );
        assert!(!markers.is_marked(&SessionKey::new("S1", "U1")).await);
    }

    #[tokio::test]
    async fn test_foreign_session_is_not_found() {
        let (handler, registry, _, _) = setup().await;
        let (_, interaction_id) = linked(&registry).await;
        assert!(matches!(
            handler.reconnect("S2", &interaction_id).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            handler.reconnect("S1", "int_missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
