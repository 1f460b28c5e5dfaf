//! 存储抽象层
//!
//! 定义统一的执行 / 交互 / 事件存储接口，支持内存和 SQLite 两种实现。
//! 所有状态写入都是「比较后设置」，由注册表在其上实现状态机。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::types::{Execution, ExecutionId, Interaction, InteractionId, NewStatusEvent, StatusEvent};
use crate::core::{ExecutionState, Result, SessionKey};

/// 一次状态变更（附带终态输出 / 错误）
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: ExecutionState,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl StateChange {
    pub fn to(state: ExecutionState) -> Self {
        Self {
            to: state,
            output: None,
            error: None,
        }
    }

    pub(crate) fn apply(&self, exec: &mut Execution) {
        let now = Utc::now();
        exec.state = self.to;
        exec.updated_at = now;
        if self.output.is_some() {
            exec.output = self.output.clone();
        }
        if self.error.is_some() {
            exec.error = self.error.clone();
        }
        if self.to.is_terminal() {
            exec.completed_at = Some(now);
        }
    }
}

/// 存储接口
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, exec: &Execution) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;

    /// 当前状态等于 `expected` 时应用变更并返回新记录；否则返回 None
    async fn compare_and_set_state(
        &self,
        id: &str,
        expected: ExecutionState,
        change: &StateChange,
    ) -> Result<Option<Execution>>;

    /// 刷新 updated_at（worker 汇报进度时调用）
    async fn touch_execution(&self, id: &str) -> Result<()>;

    async fn set_batch(&self, id: &str, batch_id: &str) -> Result<()>;

    async fn merge_metadata(&self, id: &str, patch: serde_json::Map<String, serde_json::Value>) -> Result<()>;

    /// (session, user) 下所有非终态执行，按创建时间升序
    async fn list_active(&self, key: &SessionKey) -> Result<Vec<Execution>>;

    /// 任意后代是否处于非终态
    async fn has_active_descendant(&self, id: &str) -> Result<bool>;

    async fn insert_interaction(&self, interaction: &Interaction) -> Result<()>;

    async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>>;

    async fn link_interaction(&self, id: &str, execution_id: &str) -> Result<()>;

    /// 写入回答；`only_if_empty` 时仅在尚无回答时写入。返回是否写入
    async fn set_answer(&self, id: &str, answer: &str, only_if_empty: bool) -> Result<bool>;

    async fn set_streaming(&self, id: &str, streaming: bool) -> Result<()>;

    async fn interaction_for_execution(&self, execution_id: &str) -> Result<Option<Interaction>>;

    async fn interactions_by_question(&self, session_id: &str, question: &str) -> Result<Vec<Interaction>>;

    /// 会话历史（按创建时间升序）
    async fn list_interactions(&self, session_id: &str) -> Result<Vec<Interaction>>;

    /// 追加事件，分配序号并保证时间戳严格递增
    async fn append_event(&self, event: NewStatusEvent) -> Result<StatusEvent>;

    async fn list_events(&self, interaction_id: &str) -> Result<Vec<StatusEvent>>;
}

#[derive(Default)]
struct Tables {
    executions: HashMap<ExecutionId, Execution>,
    /// (session, user) -> 非终态执行
    active_index: HashMap<SessionKey, HashSet<ExecutionId>>,
    children: HashMap<ExecutionId, Vec<ExecutionId>>,
    interactions: HashMap<InteractionId, Interaction>,
    session_interactions: HashMap<String, Vec<InteractionId>>,
    by_execution: HashMap<ExecutionId, InteractionId>,
    events: HashMap<InteractionId, Vec<StatusEvent>>,
}

impl Tables {
    fn reindex(&mut self, exec: &Execution) {
        let key = SessionKey::new(exec.session_id.clone(), exec.user_id.clone());
        if exec.state.is_active() {
            self.active_index.entry(key).or_default().insert(exec.id.clone());
        } else if let Some(ids) = self.active_index.get_mut(&key) {
            ids.remove(&exec.id);
            if ids.is_empty() {
                self.active_index.remove(&key);
            }
        }
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(what: &str, id: &str) -> crate::core::OrchestratorError {
    crate::core::OrchestratorError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_execution(&self, exec: &Execution) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(parent) = &exec.parent_execution_id {
            tables.children.entry(parent.clone()).or_default().push(exec.id.clone());
        }
        tables.reindex(exec);
        tables.executions.insert(exec.id.clone(), exec.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.tables.read().await.executions.get(id).cloned())
    }

    async fn compare_and_set_state(
        &self,
        id: &str,
        expected: ExecutionState,
        change: &StateChange,
    ) -> Result<Option<Execution>> {
        let mut tables = self.tables.write().await;
        let updated = match tables.executions.get_mut(id) {
            Some(exec) if exec.state == expected => {
                change.apply(exec);
                exec.clone()
            }
            _ => return Ok(None),
        };
        tables.reindex(&updated);
        Ok(Some(updated))
    }

    async fn touch_execution(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let exec = tables.executions.get_mut(id).ok_or_else(|| not_found("execution", id))?;
        exec.updated_at = Utc::now();
        Ok(())
    }

    async fn set_batch(&self, id: &str, batch_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let exec = tables.executions.get_mut(id).ok_or_else(|| not_found("execution", id))?;
        exec.batch_id = Some(batch_id.to_string());
        exec.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_metadata(&self, id: &str, patch: serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let exec = tables.executions.get_mut(id).ok_or_else(|| not_found("execution", id))?;
        exec.metadata.extend(patch);
        Ok(())
    }

    async fn list_active(&self, key: &SessionKey) -> Result<Vec<Execution>> {
        let tables = self.tables.read().await;
        let mut active: Vec<Execution> = tables
            .active_index
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| tables.executions.get(id).cloned()).collect())
            .unwrap_or_default();
        active.sort_by_key(|e| e.created_at);
        Ok(active)
    }

    async fn has_active_descendant(&self, id: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        let mut frontier: Vec<&ExecutionId> = tables.children.get(id).map(|c| c.iter().collect()).unwrap_or_default();
        let mut seen = HashSet::new();
        while let Some(child) = frontier.pop() {
            if !seen.insert(child) {
                continue;
            }
            if tables.executions.get(child).map(|e| e.state.is_active()).unwrap_or(false) {
                return Ok(true);
            }
            if let Some(grandchildren) = tables.children.get(child) {
                frontier.extend(grandchildren.iter());
            }
        }
        Ok(false)
    }

    async fn insert_interaction(&self, interaction: &Interaction) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .session_interactions
            .entry(interaction.session_id.clone())
            .or_default()
            .push(interaction.id.clone());
        if let Some(exec_id) = &interaction.execution_id {
            tables.by_execution.insert(exec_id.clone(), interaction.id.clone());
        }
        tables.interactions.insert(interaction.id.clone(), interaction.clone());
        Ok(())
    }

    async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        Ok(self.tables.read().await.interactions.get(id).cloned())
    }

    async fn link_interaction(&self, id: &str, execution_id: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        let interaction = tables.interactions.get_mut(id).ok_or_else(|| not_found("interaction", id))?;
        let previous = interaction.execution_id.replace(execution_id.to_string());
        interaction.updated_at = Utc::now();
        if let Some(previous) = previous {
            tables.by_execution.remove(&previous);
        }
        tables.by_execution.insert(execution_id.to_string(), id.to_string());
        Ok(())
    }

    async fn set_answer(&self, id: &str, answer: &str, only_if_empty: bool) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let interaction = tables.interactions.get_mut(id).ok_or_else(|| not_found("interaction", id))?;
        if only_if_empty && interaction.answer.is_some() {
            return Ok(false);
        }
        interaction.answer = Some(answer.to_string());
        interaction.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_streaming(&self, id: &str, streaming: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        let interaction = tables.interactions.get_mut(id).ok_or_else(|| not_found("interaction", id))?;
        interaction.is_streaming = streaming;
        interaction.updated_at = Utc::now();
        Ok(())
    }

    async fn interaction_for_execution(&self, execution_id: &str) -> Result<Option<Interaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_execution
            .get(execution_id)
            .and_then(|id| tables.interactions.get(id))
            .cloned())
    }

    async fn interactions_by_question(&self, session_id: &str, question: &str) -> Result<Vec<Interaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .session_interactions
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.interactions.get(id))
                    .filter(|i| i.question == question)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_interactions(&self, session_id: &str) -> Result<Vec<Interaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .session_interactions
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| tables.interactions.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn append_event(&self, event: NewStatusEvent) -> Result<StatusEvent> {
        let mut tables = self.tables.write().await;
        let log = tables.events.entry(event.interaction_id.clone()).or_default();
        let last = log.last().map(|e| e.timestamp);
        let stored = event.into_event(log.len() as u64 + 1, last);
        log.push(stored.clone());
        Ok(stored)
    }

    async fn list_events(&self, interaction_id: &str) -> Result<Vec<StatusEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .get(interaction_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// 创建存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite；否则使用内存存储
pub async fn create_store(db_path: Option<&std::path::Path>) -> Arc<dyn ExecutionStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match super::sqlite::SqliteStore::open(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite execution store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("SQLite store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory execution store");
    Arc::new(MemoryStore::new())
}
