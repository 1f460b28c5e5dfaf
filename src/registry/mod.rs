//! 执行注册表与状态机
//!
//! Execution / Interaction 是唯一的共享可变状态，所有写入都经由这里：
//! - **状态迁移**：只允许沿状态格前进，终态不可离开
//! - **终态标记**：`mark_completed` / `mark_failed` / `mark_cancelled` 幂等，重复调用静默返回
//! - **活跃索引**：按 (session, user) 查找非终态执行
//! - **工作流组合**：扁平表 + parent 外键，后代查询判断「工作流是否活跃」

mod store;
#[cfg(feature = "async-sqlite")]
mod sqlite;
mod types;

use std::sync::Arc;

use tracing::{debug, warn};

pub use store::{create_store, ExecutionStore, MemoryStore, StateChange};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
pub use types::{
    EventSource, Execution, ExecutionId, Interaction, InteractionId, NewExecution, NewStatusEvent,
    StatusEvent,
};

use crate::core::{ExecutionState, OrchestratorError, Result, SessionKey};

/// 比较后设置失败时的最大重试次数（并发 worker 交错推进状态）
const MAX_CAS_RETRIES: usize = 8;

/// 终态标记结果
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    /// 本次调用完成了迁移
    Applied(Execution),
    /// 已处于终态，未做任何修改
    AlreadyTerminal(Execution),
}

impl TerminalOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn execution(&self) -> &Execution {
        match self {
            Self::Applied(e) | Self::AlreadyTerminal(e) => e,
        }
    }
}

/// 执行注册表
#[derive(Clone)]
pub struct ExecutionRegistry {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionRegistry {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// 创建执行（初始 pending）
    pub async fn create(&self, new: NewExecution) -> Result<Execution> {
        let exec = new.into_execution();
        self.store.insert_execution(&exec).await?;
        debug!(execution_id = %exec.id, strategy = %exec.strategy, "execution created");
        Ok(exec)
    }

    /// 在父执行下创建子执行；父执行必须存在且非终态
    pub async fn create_child(&self, parent_id: &str, mut new: NewExecution) -> Result<Execution> {
        let parent = self.require(parent_id).await?;
        if parent.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                from: parent.state,
                to: ExecutionState::Pending,
            });
        }
        new.parent_execution_id = Some(parent.id);
        self.create(new).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Execution>> {
        self.store.get_execution(id).await
    }

    pub async fn require(&self, id: &str) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("execution {}", id)))
    }

    /// 非终态之间的前进迁移
    pub async fn transition(&self, id: &str, to: ExecutionState) -> Result<Execution> {
        self.apply(id, StateChange::to(to)).await
    }

    /// 通用迁移：校验状态格后比较并设置；并发修改时重读重试
    async fn apply(&self, id: &str, change: StateChange) -> Result<Execution> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.require(id).await?;
            if !current.state.can_transition_to(change.to) {
                warn!(
                    execution_id = %id,
                    from = %current.state,
                    to = %change.to,
                    "rejected invalid execution transition"
                );
                return Err(OrchestratorError::InvalidTransition {
                    from: current.state,
                    to: change.to,
                });
            }
            if let Some(updated) = self.store.compare_and_set_state(id, current.state, &change).await? {
                debug!(execution_id = %id, from = %current.state, to = %change.to, "execution transitioned");
                return Ok(updated);
            }
        }
        Err(OrchestratorError::Storage(format!(
            "execution {} kept changing under concurrent updates",
            id
        )))
    }

    /// 幂等终态迁移
    async fn finish(&self, id: &str, change: StateChange) -> Result<TerminalOutcome> {
        match self.apply(id, change).await {
            Ok(exec) => Ok(TerminalOutcome::Applied(exec)),
            Err(OrchestratorError::InvalidTransition { from, .. }) if from.is_terminal() => {
                let exec = self.require(id).await?;
                debug!(execution_id = %id, state = %exec.state, "terminal mark ignored, already terminal");
                Ok(TerminalOutcome::AlreadyTerminal(exec))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mark_completed(&self, id: &str, output: impl Into<String>) -> Result<TerminalOutcome> {
        self.finish(
            id,
            StateChange {
                to: ExecutionState::Completed,
                output: Some(output.into()),
                error: None,
            },
        )
        .await
    }

    pub async fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<TerminalOutcome> {
        self.finish(
            id,
            StateChange {
                to: ExecutionState::Failed,
                output: None,
                error: Some(error.into()),
            },
        )
        .await
    }

    pub async fn mark_cancelled(&self, id: &str) -> Result<TerminalOutcome> {
        self.finish(id, StateChange::to(ExecutionState::Cancelled)).await
    }

    /// (session, user) 下最早的非终态执行
    pub async fn find_active_for_session(&self, session_id: &str, user_id: &str) -> Result<Option<Execution>> {
        let key = SessionKey::new(session_id, user_id);
        Ok(self.store.list_active(&key).await?.into_iter().next())
    }

    pub async fn list_active_for_session(&self, session_id: &str, user_id: &str) -> Result<Vec<Execution>> {
        self.store.list_active(&SessionKey::new(session_id, user_id)).await
    }

    /// 本节点或任一后代处于非终态
    pub async fn is_workflow_active(&self, id: &str) -> Result<bool> {
        let exec = self.require(id).await?;
        if exec.state.is_active() {
            return Ok(true);
        }
        self.store.has_active_descendant(id).await
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        self.store.touch_execution(id).await
    }

    pub async fn attach_batch(&self, id: &str, batch_id: &str) -> Result<()> {
        self.store.set_batch(id, batch_id).await
    }

    pub async fn merge_metadata(&self, id: &str, patch: serde_json::Map<String, serde_json::Value>) -> Result<()> {
        self.store.merge_metadata(id, patch).await
    }

    // ---- Interaction ----

    pub async fn create_interaction(&self, interaction: &Interaction) -> Result<()> {
        self.store.insert_interaction(interaction).await
    }

    pub async fn interaction(&self, id: &str) -> Result<Option<Interaction>> {
        self.store.get_interaction(id).await
    }

    pub async fn link_interaction(&self, interaction_id: &str, execution_id: &str) -> Result<()> {
        self.store.link_interaction(interaction_id, execution_id).await
    }

    pub async fn interaction_for_execution(&self, execution_id: &str) -> Result<Option<Interaction>> {
        self.store.interaction_for_execution(execution_id).await
    }

    /// 工作流所属的交互：沿 parent 链向上，取第一个关联了交互的执行
    pub async fn interaction_for_workflow(&self, execution_id: &str) -> Result<Option<Interaction>> {
        let mut current = execution_id.to_string();
        loop {
            if let Some(interaction) = self.store.interaction_for_execution(&current).await? {
                return Ok(Some(interaction));
            }
            match self.require(&current).await?.parent_execution_id {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }

    pub async fn find_interactions_by_question(&self, session_id: &str, question: &str) -> Result<Vec<Interaction>> {
        self.store.interactions_by_question(session_id, question).await
    }

    pub async fn write_answer(&self, interaction_id: &str, answer: &str) -> Result<()> {
        self.store.set_answer(interaction_id, answer, false).await.map(|_| ())
    }

    /// 仅在尚无回答时写入（取消消息不覆盖已有的部分结果）
    pub async fn write_answer_if_empty(&self, interaction_id: &str, answer: &str) -> Result<bool> {
        self.store.set_answer(interaction_id, answer, true).await
    }

    pub async fn set_streaming(&self, interaction_id: &str, streaming: bool) -> Result<()> {
        self.store.set_streaming(interaction_id, streaming).await
    }

    /// 会话历史 / 导出视图
    pub async fn list_interactions(&self, session_id: &str) -> Result<Vec<Interaction>> {
        self.store.list_interactions(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Strategy;

    fn new_exec(input: &str) -> NewExecution {
        NewExecution {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            strategy: Strategy::SingleAgent,
            input: input.to_string(),
            max_steps: 10,
            tool_override: None,
            parent_execution_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let registry = ExecutionRegistry::in_memory();
        let exec = registry.create(new_exec("Explain X")).await.unwrap();
        assert_eq!(exec.state, ExecutionState::Pending);
        assert_eq!(
            registry.find_active_for_session("s1", "u1").await.unwrap().unwrap().id,
            exec.id
        );
    }

    #[tokio::test]
    async fn test_transition_walks_the_lattice() {
        let registry = ExecutionRegistry::in_memory();
        let exec = registry.create(new_exec("q")).await.unwrap();

        for state in [
            ExecutionState::Planning,
            ExecutionState::Planned,
            ExecutionState::Executing,
            ExecutionState::Synthesizing,
        ] {
            assert_eq!(registry.transition(&exec.id, state).await.unwrap().state, state);
        }

        let err = registry.transition(&exec.id, ExecutionState::Planning).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::InvalidTransition {
                from: ExecutionState::Synthesizing,
                to: ExecutionState::Planning,
            }
        );
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_every_transition() {
        let registry = ExecutionRegistry::in_memory();
        let exec = registry.create(new_exec("q")).await.unwrap();
        registry.mark_failed(&exec.id, "boom").await.unwrap();

        for to in ExecutionState::ACTIVE
            .into_iter()
            .chain([ExecutionState::Completed, ExecutionState::Cancelled, ExecutionState::Failed])
        {
            assert!(matches!(
                registry.transition(&exec.id, to).await,
                Err(OrchestratorError::InvalidTransition { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent() {
        let registry = ExecutionRegistry::in_memory();
        let exec = registry.create(new_exec("q")).await.unwrap();

        let first = registry.mark_completed(&exec.id, "X is...").await.unwrap();
        assert!(first.is_applied());

        let second = registry.mark_completed(&exec.id, "other").await.unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.execution().output.as_deref(), Some("X is..."));

        let late_failure = registry.mark_failed(&exec.id, "worker crashed").await.unwrap();
        assert!(!late_failure.is_applied());
        assert_eq!(late_failure.execution().state, ExecutionState::Completed);
        assert!(late_failure.execution().error.is_none());
    }

    #[tokio::test]
    async fn test_workflow_activity_follows_descendants() {
        let registry = ExecutionRegistry::in_memory();
        let root = registry.create(new_exec("root")).await.unwrap();
        let child = registry.create_child(&root.id, new_exec("child")).await.unwrap();
        assert_eq!(child.parent_execution_id.as_deref(), Some(root.id.as_str()));

        registry.mark_completed(&root.id, "planned").await.unwrap();
        assert!(registry.is_workflow_active(&root.id).await.unwrap());

        registry.mark_completed(&child.id, "done").await.unwrap();
        assert!(!registry.is_workflow_active(&root.id).await.unwrap());

        assert!(registry.create_child(&root.id, new_exec("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_execution_is_not_found() {
        let registry = ExecutionRegistry::in_memory();
        assert!(matches!(
            registry.mark_completed("exec_missing", "x").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_workflow_interaction_is_inherited_from_root() {
        let registry = ExecutionRegistry::in_memory();
        let root = registry.create(new_exec("Research X")).await.unwrap();
        let interaction = Interaction::new("s1", "u1", "Research X");
        registry.create_interaction(&interaction).await.unwrap();
        registry.link_interaction(&interaction.id, &root.id).await.unwrap();

        let child = registry.create_child(&root.id, new_exec("part")).await.unwrap();
        let grandchild = registry.create_child(&child.id, new_exec("sub part")).await.unwrap();

        assert!(registry.interaction_for_execution(&grandchild.id).await.unwrap().is_none());
        let found = registry.interaction_for_workflow(&grandchild.id).await.unwrap().unwrap();
        assert_eq!(found.id, interaction.id);

        let orphan = registry.create(new_exec("alone")).await.unwrap();
        assert!(registry.interaction_for_workflow(&orphan.id).await.unwrap().is_none());
    }
}
